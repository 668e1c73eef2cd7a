//! Diesel table declarations matching `migrations/`.

// TimescaleDB hypertable (when the extension is available): one row per sensor sample
diesel::table! {
    measurements (sensor_id, time) {
        time -> Timestamptz,
        sensor_id -> Text,
        t1 -> Nullable<Double>,
        t2 -> Nullable<Double>,
        h -> Nullable<Double>,
        r -> Nullable<Double>,
        rf -> Nullable<BigInt>,
        rr -> Nullable<Double>,
    }
}

// Declarative sensor -> room mapping, replaced wholesale on every sync
diesel::table! {
    room_assoc (id) {
        id -> BigInt,
        sensor_id -> Text,
        room_id -> Text,
        start_date -> Nullable<Timestamptz>,
        end_date -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(measurements, room_assoc);
