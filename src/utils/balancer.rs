use crate::error::{CcError, Result};
use log::info;
#[cfg(feature = "multinode")]
use mpi::{collective::SystemOperation, environment::Universe, traits::*};

/// Spreads days over workers. With the `multinode` feature every MPI rank is a worker,
/// otherwise the process is the only one.
pub struct Balancer {
    #[cfg(feature = "multinode")]
    universe: Universe,
    pub rank: usize,
    pub size: usize,
}

impl Balancer {
    /// Initializes MPI and reads this process' rank.
    #[cfg(feature = "multinode")]
    pub fn new() -> Result<Self> {
        let universe = mpi::initialize()
            .ok_or_else(|| CcError::configuration("MPI is already initialized"))?;
        let world = universe.world();

        // This is the node id and total number of nodes
        let rank = world.rank() as usize;
        let size = world.size() as usize;

        let balancer = Balancer {
            universe,
            rank,
            size,
        };
        balancer.announce();
        Ok(balancer)
    }

    #[cfg(not(feature = "multinode"))]
    pub fn new() -> Result<Self> {
        let balancer = Balancer { rank: 0, size: 1 };
        balancer.announce();
        Ok(balancer)
    }

    fn announce(&self) {
        if self.rank == 0 {
            info!("balancer: {} worker(s)", self.size);
        }
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Calculates local set of items on which to work on.
    pub fn local_set<I: Clone>(&self, items: &[I]) -> Vec<I> {
        stride_split(items, self.rank, self.size)
    }

    /// Blocks until every worker gets here.
    pub fn barrier(&self) {
        #[cfg(feature = "multinode")]
        self.universe.world().barrier();
    }

    /// Whether any worker reports a failure. Collective: every worker must call it.
    pub fn any_failed(&self, failed: bool) -> bool {
        #[cfg(feature = "multinode")]
        let failed = {
            let local = failed as u32;
            let mut total = 0_u32;
            self.universe
                .world()
                .all_reduce_into(&local, &mut total, SystemOperation::sum());
            total > 0
        };
        failed
    }

    /// Passes `result` through only if every worker's result is `Ok`. Collective: every
    /// worker must call it, including those whose own result is an error.
    pub fn all_ok<T>(&self, result: Result<T>) -> Result<T> {
        let failed = self.any_failed(result.is_err());
        match result {
            Ok(_) if failed => Err(CcError::configuration(format!(
                "rank {}: another worker failed",
                self.rank
            ))),
            result => result,
        }
    }
}

/// Items `rank, rank + size, rank + 2 * size, ...`.
pub fn stride_split<I: Clone>(items: &[I], rank: usize, size: usize) -> Vec<I> {
    items.iter().skip(rank).step_by(size.max(1)).cloned().collect()
}

#[test]
fn test_stride_split_assigns_every_item_once() {
    let days: Vec<usize> = (0..11).collect();
    let size = 4;

    let mut seen: Vec<usize> = (0..size)
        .flat_map(|rank| stride_split(&days, rank, size))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, days);

    assert_eq!(stride_split(&days, 1, size), vec![1, 5, 9]);
}

#[test]
fn test_more_workers_than_items() {
    let days = vec!["2010_01_01", "2010_01_02"];
    assert_eq!(stride_split(&days, 0, 3), vec!["2010_01_01"]);
    assert!(stride_split(&days, 2, 3).is_empty());
}

#[cfg(not(feature = "multinode"))]
#[test]
fn test_single_worker_gets_everything() {
    let balancer = Balancer {
        rank: 0,
        size: 1,
    };
    assert_eq!(balancer.local_set(&[1, 2, 3]), vec![1, 2, 3]);
    assert!(!balancer.any_failed(false));
    assert!(balancer.any_failed(true));
}

#[cfg(not(feature = "multinode"))]
#[test]
fn test_single_worker_setup_result_passes_through() {
    let balancer = Balancer { rank: 0, size: 1 };
    assert_eq!(balancer.all_ok(Ok(7)).unwrap(), 7);

    let err = balancer
        .all_ok::<()>(Err(CcError::configuration("cannot write cc_metadata.json")))
        .unwrap_err();
    assert!(matches!(err, CcError::Configuration(msg) if msg.contains("cc_metadata")));
}
