//! Apply the billing schema to the configured database.

use anyhow::Context;
use tracing::info;

use chalak_infra::{BillingConfig, PostgresBillingStore};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = BillingConfig::from_env().context("loading configuration")?;
    chalak_observability::init(&config.log());

    let db = config.database().context("database configuration")?;
    let store = PostgresBillingStore::connect(&db)
        .await
        .context("connecting to database")?;

    store.migrate().await.context("running migrations")?;
    info!("billing schema is up to date");
    Ok(())
}
