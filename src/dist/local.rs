use std::{num::NonZeroUsize, sync::Arc};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Collective, CollectiveError, CoordContext, ScalarMap, reduced, split};

/// Builds the members of an in-process worker group.
///
/// Each member is moved into its own task or thread and behaves like a worker
/// process: reductions block until every member contributed.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates every member of a group of `world_size` workers.
    ///
    /// # Arguments
    /// * `world_size` - The amount of members.
    ///
    /// # Returns
    /// One collective per rank, ordered by rank.
    pub fn new(world_size: NonZeroUsize) -> Vec<LocalCollective> {
        let (done, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            world_size: world_size.get(),
            round: Mutex::new(Round::default()),
            done,
        });

        (0..world_size.get())
            .map(|rank| LocalCollective {
                ctx: CoordContext {
                    rank,
                    world_size,
                },
                shared: Arc::clone(&shared),
                left: false,
            })
            .collect()
    }
}

#[derive(Default)]
struct Round {
    generation: u64,
    arrived: usize,
    keys: Vec<String>,
    sums: Vec<f64>,
    last_keys: Vec<String>,
    last_sums: Vec<f64>,
    poisoned: Option<String>,
}

struct Shared {
    world_size: usize,
    round: Mutex<Round>,
    done: watch::Sender<u64>,
}

enum Arrival {
    Complete(ScalarMap),
    Wait(u64),
}

impl Shared {
    fn poison(&self, round: &mut Round, reason: String) {
        if round.poisoned.is_none() {
            round.poisoned = Some(reason);
        }

        self.done.send_modify(|_| {});
    }

    fn arrive(
        &self,
        rank: usize,
        keys: Vec<String>,
        values: Vec<f64>,
        average: bool,
    ) -> Result<Arrival, CollectiveError> {
        let mut round = self.round.lock();

        if let Some(reason) = &round.poisoned {
            return Err(CollectiveError::Aborted(reason.clone()));
        }

        if round.arrived == 0 {
            round.keys = keys;
            round.sums = values;
        } else if round.keys != keys {
            let err = CollectiveError::KeyMismatch {
                rank,
                expected: round.keys.clone(),
                got: keys,
            };
            self.poison(&mut round, err.to_string());
            return Err(err);
        } else {
            round
                .sums
                .iter_mut()
                .zip(&values)
                .for_each(|(acc, v)| *acc += v);
        }

        round.arrived += 1;
        let generation = round.generation;

        if round.arrived < self.world_size {
            return Ok(Arrival::Wait(generation));
        }

        round.last_keys = std::mem::take(&mut round.keys);
        round.last_sums = std::mem::take(&mut round.sums);
        round.arrived = 0;
        round.generation += 1;
        self.done.send_replace(round.generation);

        Ok(Arrival::Complete(reduced(
            &round.last_keys,
            &round.last_sums,
            self.world_size,
            average,
        )))
    }

    /// Checks whether the round started at `generation` completed.
    fn outcome(
        &self,
        generation: u64,
        average: bool,
    ) -> Option<Result<ScalarMap, CollectiveError>> {
        let round = self.round.lock();

        // Completion wins over a later poisoning: the result is already final.
        if round.generation > generation {
            return Some(Ok(reduced(
                &round.last_keys,
                &round.last_sums,
                self.world_size,
                average,
            )));
        }

        round
            .poisoned
            .as_ref()
            .map(|reason| Err(CollectiveError::Aborted(reason.clone())))
    }
}

/// One member of a `LocalGroup`.
pub struct LocalCollective {
    ctx: CoordContext,
    shared: Arc<Shared>,
    left: bool,
}

impl Collective for LocalCollective {
    fn context(&self) -> &CoordContext {
        &self.ctx
    }

    async fn all_reduce(
        &mut self,
        values: &ScalarMap,
        average: bool,
    ) -> Result<ScalarMap, CollectiveError> {
        if self.ctx.world_size() == 1 {
            return Ok(values.clone());
        }

        let (keys, values) = split(values);
        let mut done_rx = self.shared.done.subscribe();

        let generation = match self.shared.arrive(self.ctx.rank(), keys, values, average)? {
            Arrival::Complete(result) => return Ok(result),
            Arrival::Wait(generation) => generation,
        };

        loop {
            done_rx.changed().await.map_err(|_| {
                CollectiveError::Aborted("the worker group was dropped".to_string())
            })?;

            if let Some(outcome) = self.shared.outcome(generation, average) {
                return outcome;
            }
        }
    }

    async fn abort(&mut self, reason: &str) {
        warn!(rank = self.ctx.rank(); "aborting worker group: {reason}");

        let mut round = self.shared.round.lock();
        self.shared
            .poison(&mut round, format!("rank {}: {reason}", self.ctx.rank()));
        self.left = true;
    }
}

impl Drop for LocalCollective {
    fn drop(&mut self) {
        if self.left || self.ctx.world_size() == 1 {
            return;
        }

        debug!(rank = self.ctx.rank(); "leaving worker group");
        let mut round = self.shared.round.lock();
        let reason = format!("rank {} left the worker group", self.ctx.rank());
        self.shared.poison(&mut round, reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn group(n: usize) -> Vec<LocalCollective> {
        LocalGroup::new(NonZeroUsize::new(n).unwrap())
    }

    fn map(entries: &[(&str, f64)]) -> ScalarMap {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_member_sees_the_same_sum() {
        let mut handles = Vec::new();

        for mut member in group(4) {
            handles.push(tokio::spawn(async move {
                let rank = member.context().rank() as f64;
                let values = map(&[("count", 1.0), ("total", rank)]);

                let summed = member.all_reduce(&values, false).await.unwrap();
                let averaged = member.all_reduce(&values, true).await.unwrap();
                (summed, averaged)
            }));
        }

        for handle in handles {
            let (summed, averaged) = handle.await.unwrap();
            assert_eq!(summed, map(&[("count", 4.0), ("total", 6.0)]));
            assert_eq!(averaged, map(&[("count", 1.0), ("total", 1.5)]));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mismatched_keys_fail_on_every_member() {
        let mut members = group(2);
        let mut second = members.pop().unwrap();
        let mut first = members.pop().unwrap();

        let a = tokio::spawn(async move { first.all_reduce(&map(&[("loss", 1.0)]), false).await });
        let b = tokio::spawn(async move {
            second
                .all_reduce(&map(&[("loss", 1.0), ("loss_bbox", 2.0)]), false)
                .await
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_err());
        assert!(b.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_releases_blocked_peers() {
        let mut members = group(2);
        let mut second = members.pop().unwrap();
        let mut first = members.pop().unwrap();

        let blocked = tokio::spawn(async move { first.all_reduce(&map(&[("loss", 1.0)]), false).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        second.abort("loss is NaN").await;

        let res = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("blocked peer was not released")
            .unwrap();
        assert!(matches!(res, Err(CollectiveError::Aborted(reason)) if reason.contains("NaN")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_member_fails_the_next_round() {
        let mut members = group(2);
        drop(members.pop());
        let mut first = members.pop().unwrap();

        let res = first.all_reduce(&map(&[("loss", 1.0)]), false).await;
        assert!(matches!(res, Err(CollectiveError::Aborted(_))));
    }
}
