//! Choosing server replicas for a model version

use quay_types::{Model, ServerReplica, ServerSnapshot};
use std::cmp::Reverse;

/// Where a model version should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub server: String,
    pub replicas: Vec<u32>,
}

/// Current placement of the version being scheduled, if any
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentPlacement<'a> {
    pub server: Option<&'a str>,
    pub replicas: &'a [u32],
}

fn free_memory(eligible: &[(u32, &ServerReplica)]) -> u64 {
    eligible.iter().map(|(_, r)| r.available_memory_bytes).sum()
}

fn hosts_model(replica: &ServerReplica, model_name: &str) -> bool {
    replica.loaded_models.iter().any(|id| id.name == model_name)
}

/// Pick `deployment_spec.replicas` replicas on a single server.
///
/// A replica is eligible when it advertises every required capability and
/// either has room for the model or already hosts a version of it. The
/// current server is kept when it still has enough eligible replicas;
/// otherwise the server with the most free memory wins. Within a server,
/// replicas already running the version come first, then the emptiest.
///
/// Zero replicas on a version that was never placed yields `Ok(None)`:
/// there is nothing to place and nothing to release.
pub fn place(
    model: &Model,
    servers: &[ServerSnapshot],
    current: CurrentPlacement<'_>,
) -> Result<Option<PlacementDecision>, String> {
    let wanted = model.deployment_spec.replicas as usize;
    let memory = model.model_spec.memory_bytes.unwrap_or(0);
    let requirements = &model.model_spec.requirements;

    if wanted == 0 {
        return Ok(current.server.map(|server| PlacementDecision {
            server: server.to_string(),
            replicas: Vec::new(),
        }));
    }

    let mut candidates: Vec<_> = servers
        .iter()
        .filter(|s| model.model_spec.server.as_deref().map_or(true, |n| n == s.name))
        .map(|s| {
            let eligible: Vec<(u32, &ServerReplica)> = s
                .replicas
                .iter()
                .filter(|(_, r)| r.satisfies(requirements))
                .filter(|(idx, r)| {
                    r.available_memory_bytes >= memory
                        || hosts_model(r, model.name())
                        || (current.server == Some(s.name.as_str())
                            && current.replicas.contains(idx))
                })
                .map(|(idx, r)| (*idx, r))
                .collect();
            (s, eligible)
        })
        .filter(|(_, eligible)| eligible.len() >= wanted)
        .collect();

    if candidates.is_empty() {
        return Err(format!(
            "no server has {} replica(s) with capabilities {:?} and {} bytes free",
            wanted, requirements, memory
        ));
    }

    let is_current = |name: &str| current.server == Some(name);
    candidates.sort_by(|(a, a_eligible), (b, b_eligible)| {
        is_current(b.name.as_str())
            .cmp(&is_current(a.name.as_str()))
            .then_with(|| free_memory(b_eligible).cmp(&free_memory(a_eligible)))
            .then_with(|| a.name.cmp(&b.name))
    });

    let (server, mut eligible) = candidates.swap_remove(0);
    let on_current = current.server == Some(server.name.as_str());
    eligible.sort_by_key(|(idx, r)| {
        (
            Reverse(on_current && current.replicas.contains(idx)),
            Reverse(r.available_memory_bytes),
            *idx,
        )
    });

    let mut replicas: Vec<u32> = eligible.into_iter().take(wanted).map(|(idx, _)| idx).collect();
    replicas.sort_unstable();
    Ok(Some(PlacementDecision {
        server: server.name.clone(),
        replicas,
    }))
}
