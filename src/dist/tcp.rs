use std::{borrow::Cow, future::Future, net::SocketAddr, num::NonZeroUsize, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use futures::future;
use log::{debug, info, warn};
use tokio::net::{
    TcpListener, TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use super::{Collective, CollectiveError, CoordContext, ScalarMap, reduced, split};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

enum Role {
    /// Rank zero, holds one channel per other rank, ordered by rank.
    Hub(Vec<(NetRx, NetTx)>),
    Spoke(NetRx, NetTx),
}

/// A worker group spread over processes, connected in a star around rank zero.
///
/// Every reduction is a gather at the hub, a sum in rank order and a broadcast
/// of the sums, so every rank observes bit-identical results.
pub struct TcpCollective {
    ctx: CoordContext,
    role: Role,
    round: u64,
    rx_buf: Vec<u64>,
    reduce_limit: Option<Duration>,
    aborted: Option<String>,
}

impl TcpCollective {
    /// Joins the worker group described by `ctx`, hosting it when this is the
    /// coordinator.
    ///
    /// # Arguments
    /// * `ctx` - The role of this process.
    /// * `addr` - The rendezvous address of the coordinator.
    /// * `limit` - Upper bound for connecting and the handshake.
    ///
    /// # Returns
    /// A collective connected to every peer.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if binding, connecting or the handshake fails.
    pub async fn connect(
        ctx: CoordContext,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<Self, CollectiveError> {
        if !ctx.is_distributed() {
            return Ok(Self::new(ctx, Role::Hub(Vec::new())));
        }

        if ctx.is_coordinator() {
            let listener = TcpListener::bind(addr).await?;
            Self::host(listener, ctx.world_size, limit).await
        } else {
            Self::join(addr, ctx, limit).await
        }
    }

    /// Accepts every other rank of the group on `listener`.
    ///
    /// # Arguments
    /// * `listener` - A bound listener at the rendezvous address.
    /// * `world_size` - The amount of ranks, including this one.
    /// * `limit` - Upper bound for the whole handshake.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if a peer announces an invalid or duplicated rank.
    pub async fn host(
        listener: TcpListener,
        world_size: NonZeroUsize,
        limit: Duration,
    ) -> Result<Self, CollectiveError> {
        let ctx = CoordContext {
            rank: 0,
            world_size,
        };
        let mut rx_buf: Vec<u64> = Vec::new();

        info!(
            "waiting for {} worker(s) at {}",
            world_size.get() - 1,
            listener.local_addr()?
        );

        let accept_all = async {
            let mut slots: Vec<Option<(NetRx, NetTx)>> =
                (1..world_size.get()).map(|_| None).collect();

            for _ in 1..world_size.get() {
                let (stream, peer) = listener.accept().await?;
                let (rx, tx) = stream.into_split();
                let (mut rx, tx) = comms::framed(rx, tx);

                let rank = match rx.recv_into(&mut rx_buf).await? {
                    Msg::Control(Command::Join { rank, world_size: w })
                        if w == world_size.get() && (1..w).contains(&rank) =>
                    {
                        rank
                    }
                    other => {
                        return Err(CollectiveError::Protocol(format!(
                            "{peer} opened with {other:?}"
                        )));
                    }
                };

                if slots[rank - 1].is_some() {
                    return Err(CollectiveError::Protocol(format!(
                        "rank {rank} joined twice"
                    )));
                }

                debug!(rank = rank; "worker joined from {peer}");
                slots[rank - 1] = Some((rx, tx));
            }

            Ok::<_, CollectiveError>(slots.into_iter().flatten().collect::<Vec<_>>())
        };

        let mut peers = within(limit, accept_all).await?;

        for (_, tx) in peers.iter_mut() {
            tx.send(&Msg::Control(Command::Ready)).await?;
        }

        info!("all {} worker(s) joined", world_size.get());
        Ok(Self::new(ctx, Role::Hub(peers)))
    }

    /// Connects to the hub at `addr`, retrying until `limit` elapses since the
    /// coordinator may come up later than this process.
    ///
    /// # Errors
    /// Returns a `CollectiveError` if the hub can't be reached or rejects the handshake.
    pub async fn join(
        addr: SocketAddr,
        ctx: CoordContext,
        limit: Duration,
    ) -> Result<Self, CollectiveError> {
        let handshake = async {
            let stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(e) => {
                        debug!(rank = ctx.rank(); "hub not reachable yet: {e}");
                        tokio::time::sleep(CONNECT_BACKOFF).await;
                    }
                }
            };

            let (rx, tx) = stream.into_split();
            let (mut rx, mut tx) = comms::framed(rx, tx);
            let join = Command::Join {
                rank: ctx.rank(),
                world_size: ctx.world_size(),
            };
            tx.send(&Msg::Control(join)).await?;

            let mut rx_buf: Vec<u64> = Vec::new();
            match rx.recv_into(&mut rx_buf).await? {
                Msg::Control(Command::Ready) => Ok((rx, tx)),
                Msg::Err(reason) => Err(CollectiveError::Aborted(reason.into_owned())),
                other => Err(CollectiveError::Protocol(format!(
                    "expected ready, got {}",
                    other.kind()
                ))),
            }
        };

        let (rx, tx) = within(limit, handshake).await?;
        info!(rank = ctx.rank(); "joined worker group at {addr}");
        Ok(Self::new(ctx, Role::Spoke(rx, tx)))
    }

    fn new(ctx: CoordContext, role: Role) -> Self {
        Self {
            ctx,
            role,
            round: 0,
            rx_buf: Vec::new(),
            reduce_limit: None,
            aborted: None,
        }
    }

    /// Bounds every reduction by `limit`. Without it a reduction waits for
    /// the slowest live peer and only fails once a peer is gone.
    pub fn with_reduce_timeout(mut self, limit: Option<Duration>) -> Self {
        self.reduce_limit = limit;
        self
    }

    async fn gather(
        peers: &mut [(NetRx, NetTx)],
        rx_buf: &mut Vec<u64>,
        round: u64,
        keys: &[String],
        sums: &mut [f64],
    ) -> Result<(), CollectiveError> {
        for (i, (rx, _)) in peers.iter_mut().enumerate() {
            let rank = i + 1;

            match rx.recv_into(rx_buf).await? {
                Msg::Control(Command::Reduce { round: r, keys: got }) => {
                    if r != round {
                        return Err(CollectiveError::Protocol(format!(
                            "rank {rank} is at round {r}, expected {round}"
                        )));
                    }
                    if got != keys {
                        return Err(CollectiveError::KeyMismatch {
                            rank,
                            expected: keys.to_vec(),
                            got,
                        });
                    }
                }
                Msg::Err(reason) => return Err(CollectiveError::Aborted(reason.into_owned())),
                other => {
                    return Err(CollectiveError::Protocol(format!(
                        "rank {rank} sent {} instead of a reduction",
                        other.kind()
                    )));
                }
            }

            match rx.recv_into(rx_buf).await? {
                Msg::Data(Payload::Values(values)) if values.len() == sums.len() => {
                    sums.iter_mut().zip(values.iter()).for_each(|(acc, v)| *acc += v);
                }
                Msg::Err(reason) => return Err(CollectiveError::Aborted(reason.into_owned())),
                other => {
                    return Err(CollectiveError::Protocol(format!(
                        "rank {rank} sent a malformed {} frame",
                        other.kind()
                    )));
                }
            }
        }

        Ok(())
    }

    async fn broadcast_err(peers: &mut [(NetRx, NetTx)], reason: &str) {
        let msg = Msg::Err(Cow::Borrowed(reason));
        let sent = future::join_all(peers.iter_mut().map(|(_, tx)| tx.send(&msg))).await;

        for e in sent.into_iter().filter_map(Result::err) {
            debug!("couldn't notify peer of the failure: {e}");
        }
    }
}

impl Collective for TcpCollective {
    fn context(&self) -> &CoordContext {
        &self.ctx
    }

    async fn all_reduce(
        &mut self,
        values: &ScalarMap,
        average: bool,
    ) -> Result<ScalarMap, CollectiveError> {
        if let Some(reason) = &self.aborted {
            return Err(CollectiveError::Aborted(reason.clone()));
        }

        if !self.ctx.is_distributed() {
            return Ok(values.clone());
        }

        let round = self.round;
        self.round += 1;

        let (keys, mut sums) = split(values);
        let world_size = self.ctx.world_size();
        let limit = self.reduce_limit;
        let Self { role, rx_buf, .. } = self;

        match role {
            Role::Hub(peers) => {
                let gathered = bounded(limit, Self::gather(peers, rx_buf, round, &keys, &mut sums)).await;

                if let Err(e) = gathered {
                    warn!(round = round; "reduction failed: {e}");
                    Self::broadcast_err(peers, &e.to_string()).await;
                    return Err(e);
                }

                let msg = Msg::Data(Payload::Values(&sums));
                future::try_join_all(peers.iter_mut().map(|(_, tx)| tx.send(&msg))).await?;

                Ok(reduced(&keys, &sums, world_size, average))
            }
            Role::Spoke(rx, tx) => {
                let exchange = async {
                    let announce = Command::Reduce {
                        round,
                        keys: keys.clone(),
                    };
                    tx.send(&Msg::Control(announce)).await?;
                    tx.send(&Msg::Data(Payload::Values(&sums))).await?;

                    match rx.recv_into(rx_buf).await? {
                        Msg::Data(Payload::Values(got)) if got.len() == keys.len() => {
                            Ok(reduced(&keys, got, world_size, average))
                        }
                        Msg::Err(reason) => Err(CollectiveError::Aborted(reason.into_owned())),
                        other => Err(CollectiveError::Protocol(format!(
                            "hub answered round {round} with a malformed {} frame",
                            other.kind()
                        ))),
                    }
                };

                bounded(limit, exchange).await
            }
        }
    }

    async fn abort(&mut self, reason: &str) {
        warn!(rank = self.ctx.rank(); "aborting worker group: {reason}");
        let reason = format!("rank {}: {reason}", self.ctx.rank());

        match &mut self.role {
            Role::Hub(peers) => Self::broadcast_err(peers, &reason).await,
            Role::Spoke(_, tx) => {
                if let Err(e) = tx.send(&Msg::Err(Cow::Borrowed(&reason))).await {
                    debug!("couldn't notify the hub of the failure: {e}");
                }
            }
        }

        self.aborted = Some(reason);
    }
}

async fn within<T, F>(limit: Duration, fut: F) -> Result<T, CollectiveError>
where
    F: Future<Output = Result<T, CollectiveError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CollectiveError::Timeout(limit))?
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T, CollectiveError>
where
    F: Future<Output = Result<T, CollectiveError>>,
{
    match limit {
        Some(limit) => within(limit, fut).await,
        None => fut.await,
    }
}
