diesel::table! {
    call_queue (id) {
        id -> Integer,
        contact_id -> Text,
        phone_number -> Text,
        first_name -> Text,
        full_name -> Text,
        email -> Text,
        service -> Text,
        province -> Nullable<Text>,
        retry_stage -> Integer,
        status -> Text,
        scheduled_at -> TimestamptzSqlite,
        created_at -> TimestamptzSqlite,
        last_attempt_at -> Nullable<TimestamptzSqlite>,
        last_error -> Nullable<Text>,
        call_options -> Text,
        available_slots -> Nullable<Text>,
        signed_url -> Nullable<Text>,
        first_attempt_at -> Nullable<TimestamptzSqlite>,
    }
}

diesel::table! {
    calls (call_sid) {
        call_sid -> Text,
        to_number -> Text,
        contact_id -> Text,
        retry_count -> Integer,
        status -> Text,
        created_at -> TimestamptzSqlite,
        signed_url -> Nullable<Text>,
        full_name -> Nullable<Text>,
        first_name -> Nullable<Text>,
        email -> Nullable<Text>,
        answered_by -> Nullable<Text>,
        available_slots -> Nullable<Text>,
        conversation_id -> Nullable<Text>,
        first_attempt_at -> Nullable<TimestamptzSqlite>,
        service -> Text,
        retry_scheduled -> Bool,
        province -> Nullable<Text>,
        stream_sid -> Nullable<Text>,
        transcript_summary -> Nullable<Text>,
    }
}

diesel::table! {
    incoming_calls (call_sid) {
        call_sid -> Text,
        caller_number -> Text,
        status -> Text,
        created_at -> TimestamptzSqlite,
        conversation_id -> Nullable<Text>,
        stream_sid -> Nullable<Text>,
    }
}

diesel::table! {
    follow_ups (id) {
        id -> Integer,
        contact_id -> Text,
        follow_up_at -> TimestamptzSqlite,
        status -> Text,
        province -> Nullable<Text>,
        service -> Nullable<Text>,
        created_at -> TimestamptzSqlite,
        last_error -> Nullable<Text>,
    }
}

diesel::table! {
    sales_reps (id) {
        id -> Integer,
        ghl_user_id -> Text,
        name -> Text,
        services -> Text,
        provinces -> Text,
        active -> Bool,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    crm_tokens (location_id) {
        location_id -> Text,
        access_token -> Text,
        refresh_token -> Text,
        expires_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    call_queue,
    calls,
    incoming_calls,
    follow_ups,
    sales_reps,
    crm_tokens,
);
