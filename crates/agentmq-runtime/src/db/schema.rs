diesel::table! {
    use diesel::sql_types::*;

    messages (message_id) {
        message_id -> Uuid,
        org_id -> Varchar,
        agent_id -> Nullable<Varchar>,
        #[sql_name = "type"]
        message_type -> Nullable<Varchar>,
        priority -> Nullable<Int4>,
        status -> Varchar,
        payload -> Jsonb,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    message_events (id) {
        id -> Uuid,
        message_id -> Nullable<Uuid>,
        org_id -> Varchar,
        event_type -> Varchar,
        details -> Nullable<Jsonb>,
        ts -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    dlq_messages (id) {
        id -> Uuid,
        org_id -> Varchar,
        original_message -> Jsonb,
        error -> Jsonb,
        can_replay -> Bool,
        dlq_timestamp -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    idempotency_keys (org_id, dedup_key) {
        org_id -> Varchar,
        dedup_key -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    poison_counters (org_id, dedup_key) {
        org_id -> Varchar,
        dedup_key -> Varchar,
        count -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    messages,
    message_events,
    dlq_messages,
    idempotency_keys,
    poison_counters,
);
