use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::models::{EngineError, OperationKind, OperationRequest, OperationResult};
use crate::systems::file_ops::FileOps;
use crate::utils::path_security::{normalize, overlaps};

/// The paths a request reads or changes, used to decide what must run in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    /// Targets plus the paths the request lands on.
    touched: Vec<PathBuf>,
    targets: Vec<PathBuf>,
    /// Directories the request populates.
    destinations: Vec<PathBuf>,
}

impl Footprint {
    pub fn of(request: &OperationRequest) -> Self {
        let targets: Vec<PathBuf> = request.targets.iter().map(|p| normalize(p)).collect();
        let mut touched = targets.clone();
        touched.extend(request.landing_paths().iter().map(|p| normalize(p)));

        let destinations = match (request.kind, &request.destination) {
            (OperationKind::Move | OperationKind::Copy, Some(dest)) => vec![normalize(dest)],
            _ => Vec::new(),
        };
        Self { touched, targets, destinations }
    }

    /// Two requests conflict when they touch the same path or nested paths, or
    /// when one populates a directory the other creates, moves or removes.
    pub fn conflicts_with(&self, other: &Footprint) -> bool {
        let shared = self.touched.iter().any(|a| other.touched.iter().any(|b| overlaps(a, b)));
        let feeds = |dests: &[PathBuf], targets: &[PathBuf]| {
            dests.iter().any(|d| targets.iter().any(|t| overlaps(d, t)))
        };
        shared || feeds(&self.destinations, &other.targets) || feeds(&other.destinations, &self.targets)
    }
}

/// Dependency structure of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    /// For each request, the earlier requests in the batch it must wait for.
    pub depends_on: Vec<Vec<usize>>,
    /// Weakly connected groups of the conflict graph, each in submission order.
    pub groups: Vec<Vec<usize>>,
}

impl BatchPlan {
    pub fn build(footprints: &[Footprint]) -> Self {
        let n = footprints.len();
        let mut depends_on = vec![Vec::new(); n];
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for j in 0..n {
            for i in 0..j {
                if footprints[i].conflicts_with(&footprints[j]) {
                    depends_on[j].push(i);
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    if a != b {
                        parent[b] = a;
                    }
                }
            }
        }

        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            by_root.entry(root).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
        groups.sort_by_key(|g| g[0]);

        Self { depends_on, groups }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Succeeded,
    Failed,
}

struct InFlight {
    footprint: Footprint,
    status: watch::Receiver<Status>,
}

/// Runs batches of requests, concurrently where they are independent and in
/// submission order where they conflict. Conflicts with requests still running
/// from other batches are honored too.
pub struct Scheduler {
    ops: Arc<FileOps>,
    in_flight: Arc<Mutex<HashMap<u64, InFlight>>>,
    next_ticket: AtomicU64,
}

impl Scheduler {
    pub fn new(ops: Arc<FileOps>) -> Self {
        Self {
            ops,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn registry(in_flight: &Mutex<HashMap<u64, InFlight>>) -> MutexGuard<'_, HashMap<u64, InFlight>> {
        in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn run(&self, requests: Vec<OperationRequest>) -> Vec<OperationResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let footprints: Vec<Footprint> = requests.iter().map(Footprint::of).collect();
        let plan = BatchPlan::build(&footprints);
        info!("Dispatching {} operations in {} independent groups", requests.len(), plan.groups.len());

        let mut senders = Vec::with_capacity(requests.len());
        let mut waits: Vec<Vec<watch::Receiver<Status>>> = Vec::with_capacity(requests.len());
        let mut tickets = Vec::with_capacity(requests.len());
        {
            // Registering the whole batch under one lock keeps later batches
            // from slipping in between its members.
            let mut registry = Self::registry(&self.in_flight);
            let mut receivers: Vec<watch::Receiver<Status>> = Vec::with_capacity(requests.len());
            for (index, footprint) in footprints.iter().enumerate() {
                let mut deps: Vec<watch::Receiver<Status>> = registry
                    .values()
                    .filter(|other| other.footprint.conflicts_with(footprint))
                    .map(|other| other.status.clone())
                    .collect();
                if !deps.is_empty() {
                    debug!("{} waits on {} operations from other batches", requests[index].id, deps.len());
                }
                deps.extend(plan.depends_on[index].iter().map(|&i| receivers[i].clone()));

                let (tx, rx) = watch::channel(Status::Pending);
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                registry.insert(ticket, InFlight { footprint: footprint.clone(), status: rx.clone() });
                receivers.push(rx);
                senders.push(tx);
                waits.push(deps);
                tickets.push(ticket);
            }
        }

        let originals = requests.clone();
        let mut set = JoinSet::new();
        let jobs = requests.into_iter().zip(senders).zip(waits).zip(tickets).enumerate();
        for (index, (((request, tx), deps), ticket)) in jobs {
            let ops = self.ops.clone();
            let in_flight = self.in_flight.clone();
            set.spawn(async move {
                let mut prerequisite_failed = false;
                for mut rx in deps {
                    let failed = match rx.wait_for(|s| *s != Status::Pending).await {
                        Ok(status) => *status == Status::Failed,
                        Err(_) => true,
                    };
                    prerequisite_failed |= failed;
                }

                let job = request.clone();
                let mut result = match tokio::task::spawn_blocking(move || ops.execute(&job, index)).await {
                    Ok(result) => result,
                    Err(e) => OperationResult::failed(&request, Vec::new(), EngineError::new(format!("Handler panicked: {}", e))),
                };

                if prerequisite_failed {
                    if let Some(EngineError::ValidationError(msg)) = &result.error {
                        warn!("{} {} failed after an earlier conflicting operation failed", request.kind, request.id);
                        result.error = Some(EngineError::PrerequisiteMissing(msg.clone()));
                    }
                }

                Self::registry(&in_flight).remove(&ticket);
                let _ = tx.send(if result.success { Status::Succeeded } else { Status::Failed });
                (index, result)
            });
        }

        let mut slots: Vec<Option<OperationResult>> = vec![None; set.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!("Operation task ended abnormally: {}", e),
            }
        }
        in_request_order(&originals, slots)
    }
}

/// One result per request. A request whose task never reported back is
/// failed rather than dropped.
fn in_request_order(requests: &[OperationRequest], slots: Vec<Option<OperationResult>>) -> Vec<OperationResult> {
    requests
        .iter()
        .zip(slots)
        .map(|(request, slot)| {
            slot.unwrap_or_else(|| {
                OperationResult::failed(request, Vec::new(), EngineError::new("Operation task ended before reporting"))
            })
        })
        .collect()
}
