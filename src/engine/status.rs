use anyhow::Result;
use chrono::{DateTime, Utc};

use super::transfer::RegionTransferManager;
use crate::catalog::{RegionCatalog, RegionDescriptor};

/// Offline state of one catalog region, as shown in the region drawer.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStatus {
    pub descriptor: RegionDescriptor,
    pub available: bool,
    pub downloading: bool,
    /// Observed size once downloaded.
    pub byte_size: Option<u64>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Status for every region in `catalog`, each re-validated against the store.
pub async fn region_statuses(
    manager: &RegionTransferManager,
    catalog: &RegionCatalog,
) -> Result<Vec<RegionStatus>> {
    let mut out = Vec::with_capacity(catalog.regions().len());
    for region in catalog.regions() {
        let availability = manager.availability(&region.source_url).await?;
        out.push(RegionStatus {
            descriptor: region.clone(),
            available: availability.available,
            downloading: manager.is_in_flight(&region.source_url),
            byte_size: availability.record.as_ref().map(|r| r.byte_size),
            fetched_at: availability.record.as_ref().map(|r| r.fetched_at),
        });
    }
    Ok(out)
}

/// Network + offline-readiness indicator for the region currently on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeState {
    pub online: bool,
    /// `None` when the page names no known region.
    pub region_code: Option<String>,
    pub available: bool,
}

impl BadgeState {
    /// Resolve the badge for a `?pm=` page parameter.
    pub async fn for_pm_param(
        manager: &RegionTransferManager,
        catalog: &RegionCatalog,
        pm: Option<&str>,
        online: bool,
    ) -> Result<Self> {
        let Some(region) = pm.and_then(|pm| catalog.resolve_pm_param(pm)) else {
            return Ok(Self {
                online,
                region_code: None,
                available: false,
            });
        };
        let availability = manager.availability(&region.source_url).await?;
        Ok(Self {
            online,
            region_code: Some(region.id.clone()),
            available: availability.available,
        })
    }

    pub fn label(&self) -> String {
        let network = if self.online { "Online" } else { "Offline" };
        match &self.region_code {
            None => format!("{} · Region ?", network),
            Some(code) => {
                let mark = if self.available { "✅" } else { "⛔" };
                format!("{} · {} Offline {}", network, mark, code)
            }
        }
    }
}
