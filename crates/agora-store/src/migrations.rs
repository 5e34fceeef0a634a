use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn run(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            room_id     TEXT PRIMARY KEY,
            topic       TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'active',
            shared_note TEXT NOT NULL DEFAULT '',
            proposals   JSONB NOT NULL DEFAULT '[]'::jsonb,
            analytics   JSONB NOT NULL DEFAULT '{\"users\":{}}'::jsonb,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE IF NOT EXISTS messages (
            message_id        TEXT PRIMARY KEY,
            room_id           TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
            username          TEXT NOT NULL,
            content           TEXT NOT NULL,
            stance            TEXT NOT NULL,
            file_url          TEXT,
            original_filename TEXT,
            attachment_ref    TEXT,
            reply_to_id       TEXT REFERENCES messages(message_id) ON DELETE SET NULL,
            reactions         JSONB NOT NULL
                DEFAULT '{\"agree\":[],\"partial\":[],\"disagree\":[]}'::jsonb,
            is_resolved       BOOLEAN NOT NULL DEFAULT FALSE,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);

        CREATE TABLE IF NOT EXISTS push_subscriptions (
            id        BIGSERIAL PRIMARY KEY,
            room_id   TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
            username  TEXT NOT NULL,
            endpoint  TEXT NOT NULL,
            keys      JSONB NOT NULL,
            UNIQUE (endpoint, room_id)
        );

        CREATE INDEX IF NOT EXISTS idx_subscriptions_room
            ON push_subscriptions(room_id);
        ",
    )
    .execute(pool)
    .await?;

    info!("State store migrations complete");
    Ok(())
}
