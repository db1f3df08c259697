//! Planning: decide what to create, update and delete for one account.
//!
//! `plan` is pure. Matching runs in tiers (instance id, then IP, then
//! hostname) so an instance's match never depends on where it sits in the
//! input. Within a tier the first instance in input order wins, and an asset
//! is claimed at most once.

use std::collections::HashSet;

use tracing::debug;

use super::asset_index::{extract_instance_id, AssetIndex};
use crate::domain::asset::{ProtocolPorts, TargetState};
use crate::domain::instance::NormalizedInstance;
use crate::domain::plan::{PlannedDelete, PlannedUpdate, ReconciliationPlan};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub protected_ips: HashSet<String>,
    pub no_delete: bool,
    pub ports: ProtocolPorts,
}

impl ReconcileOptions {
    pub fn is_protected(&self, address: &str) -> bool {
        self.protected_ips.contains(address.trim())
    }
}

pub fn plan(
    instances: &[NormalizedInstance],
    index: &AssetIndex,
    options: &ReconcileOptions,
) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::default();

    let mut seen_ids = HashSet::new();
    let mut candidates: Vec<(&NormalizedInstance, TargetState)> = Vec::with_capacity(instances.len());
    for instance in instances {
        let Some(target) = TargetState::for_instance(instance, &options.ports) else {
            debug!(instance = %instance.subject(), "no IP address, excluded");
            plan.excluded += 1;
            continue;
        };
        if let Some(id) = instance.instance_id.as_deref() {
            if !seen_ids.insert(id) {
                debug!(instance_id = id, "duplicate instance id in listing, ignored");
                continue;
            }
        }
        candidates.push((instance, target));
    }

    let mut claimed = vec![false; index.assets.len()];
    let mut matched: Vec<Option<usize>> = vec![None; candidates.len()];

    for (slot, (instance, _)) in matched.iter_mut().zip(&candidates) {
        if let Some(id) = instance.instance_id.as_deref() {
            *slot = claim(index.by_instance_id.get(id), &mut claimed);
        }
    }
    for (slot, (_, target)) in matched.iter_mut().zip(&candidates) {
        if slot.is_none() {
            *slot = claim(index.by_ip.get(&target.address), &mut claimed);
        }
    }
    for (slot, (instance, _)) in matched.iter_mut().zip(&candidates) {
        if slot.is_none() {
            let host = instance.hostname.trim().to_lowercase();
            *slot = claim(index.by_hostname.get(&host), &mut claimed);
        }
    }

    for ((instance, target), slot) in candidates.iter().zip(matched) {
        match slot {
            None => plan.to_create.push((*instance).clone()),
            Some(pos) => {
                let asset = &index.assets[pos];
                let reasons = target.diff(asset);
                if reasons.is_empty() {
                    plan.skipped += 1;
                } else {
                    plan.to_update.push(PlannedUpdate {
                        asset: asset.clone(),
                        instance: (*instance).clone(),
                        reasons,
                    });
                }
            }
        }
    }

    for (asset, _) in index.assets.iter().zip(&claimed).filter(|(_, c)| !**c) {
        if options.is_protected(&asset.address) {
            plan.protected += 1;
        } else if options.no_delete {
            plan.skipped += 1;
        } else {
            let reason = match extract_instance_id(&asset.comment) {
                Some(id) => format!("instance {id} no longer exists in the cloud"),
                None => "no matching cloud instance".to_string(),
            };
            plan.to_delete.push(PlannedDelete {
                asset: asset.clone(),
                reason,
            });
        }
    }

    plan
}

/// Claim the first unclaimed asset among `positions`.
fn claim(positions: Option<&Vec<usize>>, claimed: &mut [bool]) -> Option<usize> {
    let pos = positions?.iter().copied().find(|&p| !claimed[p])?;
    claimed[pos] = true;
    Some(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::asset::{test_asset, DirectoryAsset};
    use crate::domain::instance::{test_instance, OsFamily};

    fn index(assets: Vec<DirectoryAsset>) -> AssetIndex {
        AssetIndex::from_assets("node-prod", assets)
    }

    fn linux(id: &str, ip: &str, host: &str) -> NormalizedInstance {
        test_instance(id, ip, host, OsFamily::Linux)
    }

    fn marked(id: &str, ip: &str, name: &str, instance_id: &str) -> DirectoryAsset {
        test_asset(id, ip, name, OsFamily::Linux, &format!("instance_id: {instance_id}"))
    }

    #[test]
    fn empty_directory_creates_everything() {
        let instances = vec![linux("i-1", "10.0.0.1", "web-1"), linux("i-2", "10.0.0.2", "web-2")];
        let p = plan(&instances, &index(vec![]), &ReconcileOptions::default());
        assert_eq!(p.to_create, instances);
        assert!(p.to_update.is_empty() && p.to_delete.is_empty());
        assert_eq!(p.skipped, 0);
    }

    #[test]
    fn matched_and_current_is_skipped() {
        let instances = vec![linux("i-1", "10.0.0.1", "web-1")];
        let p = plan(
            &instances,
            &index(vec![marked("a1", "10.0.0.1", "web-1", "i-1")]),
            &ReconcileOptions::default(),
        );
        assert!(p.is_noop());
        assert_eq!(p.skipped, 1);
    }

    #[test]
    fn drift_produces_update_with_reasons() {
        let instances = vec![linux("i-1", "10.0.0.9", "web-1")];
        let p = plan(
            &instances,
            &index(vec![marked("a1", "10.0.0.1", "web-1", "i-1")]),
            &ReconcileOptions::default(),
        );
        assert_eq!(p.to_update.len(), 1);
        assert_eq!(p.to_update[0].asset.id, "a1");
        assert_eq!(p.to_update[0].reasons, vec!["address 10.0.0.1 -> 10.0.0.9".to_string()]);
        assert!(p.to_create.is_empty() && p.to_delete.is_empty());
    }

    #[test]
    fn vanished_instance_is_deleted_unless_no_delete() {
        let idx = index(vec![marked("a9", "10.0.0.9", "old", "i-9")]);
        let p = plan(&[], &idx, &ReconcileOptions::default());
        assert_eq!(p.to_delete.len(), 1);
        assert_eq!(p.to_delete[0].asset.id, "a9");
        assert_eq!(p.to_delete[0].reason, "instance i-9 no longer exists in the cloud");

        let opts = ReconcileOptions {
            no_delete: true,
            ..Default::default()
        };
        let p = plan(&[], &idx, &opts);
        assert!(p.to_delete.is_empty());
        assert_eq!(p.skipped, 1);
    }

    #[test]
    fn protected_ip_is_never_deleted() {
        let idx = index(vec![
            marked("a8", "10.0.0.8", "bastion", "i-8"),
            marked("a9", "10.0.0.9", "old", "i-9"),
        ]);
        let opts = ReconcileOptions {
            protected_ips: HashSet::from(["10.0.0.8".to_string()]),
            ..Default::default()
        };
        let p = plan(&[], &idx, &opts);
        assert_eq!(p.protected, 1);
        assert_eq!(p.to_delete.len(), 1);
        assert_eq!(p.to_delete[0].asset.id, "a9");

        let both = ReconcileOptions {
            no_delete: true,
            ..opts
        };
        let p = plan(&[], &idx, &both);
        assert_eq!((p.protected, p.skipped), (1, 1));
    }

    #[test]
    fn instance_id_match_beats_earlier_ip_match() {
        // `b` comes first and shares an IP with asset x, but x carries a's id.
        let a = linux("i-a", "10.0.0.2", "host-a");
        let b = linux("i-b", "10.0.0.1", "host-b");
        let idx = index(vec![
            marked("x", "10.0.0.1", "host-a", "i-a"),
            test_asset("y", "10.0.0.2", "host-y", OsFamily::Linux, ""),
        ]);

        for order in [vec![b.clone(), a.clone()], vec![a.clone(), b.clone()]] {
            let p = plan(&order, &idx, &ReconcileOptions::default());
            let update = p.to_update.iter().find(|u| u.asset.id == "x").unwrap();
            assert_eq!(update.instance.instance_id.as_deref(), Some("i-a"));
            assert_eq!(p.to_create.len(), 1);
            assert_eq!(p.to_create[0].instance_id.as_deref(), Some("i-b"));
            assert_eq!(p.to_delete.len(), 1);
            assert_eq!(p.to_delete[0].asset.id, "y");
        }
    }

    #[test]
    fn hostname_tier_is_case_insensitive() {
        let instances = vec![linux("", "10.0.0.5", "DB-Primary")];
        let idx = index(vec![test_asset("a1", "10.9.9.9", "db-primary", OsFamily::Linux, "")]);
        let p = plan(&instances, &idx, &ReconcileOptions::default());
        assert_eq!(p.to_update.len(), 1);
        assert_eq!(p.to_update[0].reasons.len(), 2);
    }

    #[test]
    fn asset_is_claimed_at_most_once() {
        let instances = vec![linux("i-1", "10.0.0.1", "a"), linux("i-2", "10.0.0.1", "b")];
        let idx = index(vec![test_asset("a1", "10.0.0.1", "a", OsFamily::Linux, "")]);
        let p = plan(&instances, &idx, &ReconcileOptions::default());
        assert_eq!(p.skipped, 1);
        assert_eq!(p.to_create.len(), 1);
        assert_eq!(p.to_create[0].instance_id.as_deref(), Some("i-2"));
    }

    #[test]
    fn excluded_and_duplicate_instances() {
        let instances = vec![
            linux("i-1", "", "no-ip"),
            linux("i-2", "10.0.0.2", "b"),
            linux("i-2", "10.0.0.3", "b-dup"),
        ];
        let p = plan(&instances, &index(vec![]), &ReconcileOptions::default());
        assert_eq!(p.excluded, 1);
        assert_eq!(p.to_create.len(), 1);
        assert_eq!(p.to_create[0].hostname, "b");
    }

    #[test]
    fn windows_drift_is_reported_as_protocol_change() {
        let instances = vec![test_instance("i-1", "10.0.0.1", "win", OsFamily::Windows)];
        let idx = index(vec![marked("a1", "10.0.0.1", "win", "i-1")]);
        let opts = ReconcileOptions {
            ports: ProtocolPorts { ssh: 22, rdp: 13389 },
            ..Default::default()
        };
        let p = plan(&instances, &idx, &opts);
        assert_eq!(
            p.to_update[0].reasons,
            vec![
                "platform Linux -> Windows".to_string(),
                "protocol ssh/22 -> rdp/13389".to_string()
            ]
        );
    }

    #[test]
    fn plan_is_deterministic() {
        let instances = vec![
            linux("i-1", "10.0.0.1", "web-1"),
            linux("i-2", "10.0.0.2", "web-2"),
            linux("i-3", "10.0.0.3", "web-3"),
        ];
        let idx = index(vec![
            marked("a1", "10.0.0.1", "web-1", "i-1"),
            marked("a2", "10.0.0.22", "web-2", "i-2"),
            marked("a9", "10.0.0.9", "gone", "i-9"),
        ]);
        let opts = ReconcileOptions::default();
        assert_eq!(plan(&instances, &idx, &opts), plan(&instances, &idx, &opts));
    }
}
