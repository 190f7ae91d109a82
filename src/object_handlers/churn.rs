use chrono::{DateTime, Utc};
use rand::seq::index::sample;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;
use crate::io_models::job::ChurnConfig;
use crate::object_handlers::create::create_object;
use crate::object_handlers::delete::delete_named;
use crate::object_handlers::{CreatedObject, LABEL_CHURN};
use crate::rate_limiter::DispatchLimiter;

#[derive(Debug, Clone, Copy)]
pub struct ChurnStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub deleted: usize,
    pub recreated: usize,
}

/// Periodically recycle a fraction of the job's created objects: wait out
/// the cycle delay, delete the sampled victims, recreate them from their
/// stored manifests. Recreated objects carry the churn label so anything
/// landing inside the `[start, end]` window can be correlated downstream.
pub async fn run_churn(
    client: &kube::Client,
    churn: &ChurnConfig,
    inventory: &[CreatedObject],
    limiter: &DispatchLimiter,
    max_wait_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ChurnStats, BurnerError> {
    let start = Utc::now();
    let mut stats = ChurnStats {
        start,
        end: start,
        deleted: 0,
        recreated: 0,
    };

    let victims_per_cycle = inventory.len() * churn.percent.min(100) as usize / 100;
    let cycles = churn.effective_cycles();
    if victims_per_cycle == 0 || cycles == 0 {
        return Ok(stats);
    }

    let churn_labels: BTreeMap<String, String> =
        BTreeMap::from([(LABEL_CHURN.to_string(), "true".to_string())]);

    info!(
        "churning {} object(s) per cycle over {} cycle(s) every {:?}",
        victims_per_cycle, cycles, churn.delay
    );

    for cycle in 0..cycles {
        tokio::select! {
            _ = cancel.cancelled() => return Err(BurnerError::Cancelled),
            _ = tokio::time::sleep(churn.delay) => {}
        }

        let deadline = Instant::now() + max_wait_timeout;
        let picked = sample(&mut rand::rng(), inventory.len(), victims_per_cycle);
        debug!("churn cycle {} recycling {} object(s)", cycle, picked.len());

        for index in picked {
            let victim = &inventory[index];
            let name = victim.name();

            limiter.wait(cancel).await?;
            if delete_named(client, &victim.mapped, victim.namespace.as_deref(), &name, true).await? {
                stats.deleted += 1;
            }

            limiter.wait(cancel).await?;
            crate::object_handlers::retry_transient(deadline, cancel, || {
                create_object(
                    client,
                    &victim.mapped,
                    victim.namespace.as_deref(),
                    victim.manifest.clone(),
                    &churn_labels,
                    true,
                )
            })
            .await?;
            stats.recreated += 1;
        }
    }

    stats.end = Utc::now();
    Ok(stats)
}
