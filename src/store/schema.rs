use diesel::table;

table! {
    homeservers (id) {
        id -> BigInt,
        url -> Text,
        name -> Text,
        hs_token -> Text,
    }
}

table! {
    bridges (id) {
        id -> BigInt,
        orchestrator_id -> Text,
        bridge_service -> Text,
        as_token -> Text,
        hs_token -> Text,
        ip -> Text,
        port -> Integer,
        owner_matrix_username -> Text,
        matrix_bot_username -> Text,
        live_status -> Text,
        ready_status -> Text,
        status_updated_at -> Text,
        bridge_management_room_id -> Nullable<Text>,
        deleted_at -> Nullable<Text>,
    }
}

table! {
    transaction_mappings (transaction_id) {
        transaction_id -> Text,
        bridge_as_token -> Text,
        bridge_id -> BigInt,
    }
}

table! {
    room_bridge_mappings (room_id) {
        room_id -> Text,
        bridge_id -> BigInt,
        last_seen_at -> Text,
    }
}

table! {
    requests (id) {
        id -> BigInt,
        inbound_at -> Text,
        outbound_at -> Nullable<Text>,
        source -> Text,
        bridge_id -> Nullable<BigInt>,
        homeserver_id -> Nullable<BigInt>,
        bridge_discovery_method -> Nullable<Text>,
        discovery_error -> Nullable<Text>,
        method -> Text,
        path -> Text,
        inbound_request -> Text,
        outbound_request -> Nullable<Text>,
        response -> Nullable<Text>,
        response_status -> Nullable<Integer>,
    }
}
