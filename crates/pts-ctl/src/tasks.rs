//! Data-collection tasks wired into the task registry at startup.
//!
//! Registration is explicit; the registry is immutable once built.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use pts_mail::Vendor;
use pts_shared::models::Package;
use pts_shared::storage::Storage;
use pts_shared::PtsResult;
use pts_tasks::{Task, TaskContext, TaskDefinition, TaskRegistry};

const EVENT_PSEUDO_PACKAGES_UPDATED: &str = "pseudo-packages-updated";

/// Pulls the vendor's pseudo-package list and tracks any new names.
struct UpdatePseudoPackages {
    storage: Arc<dyn Storage>,
    vendor: Arc<dyn Vendor>,
}

#[async_trait]
impl Task for UpdatePseudoPackages {
    async fn execute(&mut self, ctx: &mut TaskContext) -> PtsResult<()> {
        let names = match self.vendor.get_pseudo_package_list().await {
            Some(result) => result?,
            // Vendor does not publish a pseudo-package list.
            None => return Ok(()),
        };

        let mut created = Vec::new();
        for name in names {
            if self.storage.get_package(&name).await?.is_none() {
                self.storage.create_package(Package::pseudo(&name)).await?;
                created.push(name);
            }
        }
        if !created.is_empty() {
            ctx.raise_event_with(EVENT_PSEUDO_PACKAGES_UPDATED, json!(created));
        }
        Ok(())
    }
}

/// Reports tracking totals after the package set changed.
struct ReportPackageCounts {
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl Task for ReportPackageCounts {
    async fn execute(&mut self, ctx: &mut TaskContext) -> PtsResult<()> {
        let new_names: usize = ctx
            .events()
            .iter()
            .filter_map(|event| event.arguments.as_ref())
            .filter_map(|arguments| arguments.as_array().map(Vec::len))
            .sum();
        let total = self.storage.all_packages().await?.len();
        info!(total = total, newly_tracked = new_names, "Package totals");
        Ok(())
    }
}

/// Build the process-wide task registry.
pub fn build_registry(
    storage: Arc<dyn Storage>,
    vendor: Arc<dyn Vendor>,
) -> PtsResult<TaskRegistry> {
    let mut registry = TaskRegistry::new();

    let update_storage = storage.clone();
    let update_vendor = vendor.clone();
    registry.register(
        TaskDefinition::new("update-pseudo-packages", move || {
            Box::new(UpdatePseudoPackages {
                storage: update_storage.clone(),
                vendor: update_vendor.clone(),
            })
        })
        .produces_events([EVENT_PSEUDO_PACKAGES_UPDATED])
        .clear_events_on_failure(),
    )?;

    registry.register(
        TaskDefinition::new("report-package-counts", move || {
            Box::new(ReportPackageCounts {
                storage: storage.clone(),
            })
        })
        .depends_on_events([EVENT_PSEUDO_PACKAGES_UPDATED]),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pts_mail::vendor::NullVendor;
    use pts_shared::storage::MemoryStorage;

    #[tokio::test]
    async fn registry_builds_with_expected_order() {
        let registry = build_registry(
            Arc::new(MemoryStorage::new()),
            Arc::new(NullVendor),
        )
        .unwrap();
        let names: Vec<&str> = registry.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["update-pseudo-packages", "report-package-counts"]);

        let dag = registry.build_dag().unwrap();
        assert_eq!(
            dag.direct_successors(&"update-pseudo-packages".to_string())
                .unwrap(),
            ["report-package-counts".to_string()]
        );
    }

    #[tokio::test]
    async fn null_vendor_run_completes_without_events() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = build_registry(storage.clone(), Arc::new(NullVendor)).unwrap();

        let state = pts_tasks::run_task(
            &registry,
            storage,
            "update-pseudo-packages",
            None,
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();

        // Both tasks are processed, but no event was raised so the report
        // task never executed.
        assert_eq!(
            state.processed_tasks,
            ["update-pseudo-packages", "report-package-counts"]
        );
        assert!(state.events.is_empty());
        assert!(state.is_complete);
    }
}
