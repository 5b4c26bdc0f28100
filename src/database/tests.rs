use super::*;
use tempfile::TempDir;

#[tokio::test]
async fn creates_database_and_applies_schema() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("engine.db");

    let database = Database::new(&db_path).await.expect("Failed to open database");

    assert!(db_path.exists());
    database.health_check().await.expect("Health check should pass");

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(database.pool())
    .await
    .expect("Failed to list tables");

    // The migrator tracks itself in _sqlx_migrations.
    assert_eq!(
        tables,
        vec!["_sqlx_migrations", "embeddings", "index_jobs", "usage_metrics"]
    );
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("engine.db");

    // Opening the database migrates; a second explicit run must be a no-op.
    let database = Database::new(&db_path).await.expect("Failed to open database");
    database
        .run_migrations()
        .await
        .expect("Reapplying the schema should be a no-op");
}

#[tokio::test]
async fn active_key_uniqueness_is_enforced_by_schema() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("engine.db");

    let database = Database::new(&db_path).await.expect("Failed to open database");

    let insert = "INSERT INTO embeddings (tenant_id, content_type, content_id, content_text, \
                  metadata, vector, dimension, model, created_at, updated_at) \
                  VALUES ('t', 'menu', 'item-1', 'text', '{}', x'00000000', 1, 'm', \
                          '2026-08-25 10:00:00', '2026-08-25 10:00:00')";

    sqlx::query(insert)
        .execute(database.pool())
        .await
        .expect("First insert should succeed");

    let duplicate = sqlx::query(insert).execute(database.pool()).await;
    assert!(duplicate.is_err(), "two active rows for one key must be rejected");

    sqlx::query(
        "UPDATE embeddings SET deleted_at = '2026-08-25 10:30:00' WHERE content_id = 'item-1'",
    )
    .execute(database.pool())
    .await
    .expect("Soft delete should succeed");

    sqlx::query(insert)
        .execute(database.pool())
        .await
        .expect("A new active row is allowed once the old one is soft deleted");
}

#[tokio::test]
async fn initialize_from_config_dir_places_database_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");

    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("Failed to initialize");

    assert!(temp_dir.path().join("engine.db").exists());
    database.health_check().await.expect("Health check should pass");
}
