//! Typed message-bus channels between the consensus engine and the
//! transport layer.
//!
//! The bus is a set of typed unbounded FIFO channels; each typed channel
//! has exactly one reader (the corresponding handler) and one or more
//! writers (the transport layer). Three handles are produced:
//!
//! - [`NetHandle`]: held by the engine. Outbound broadcasts plus the
//!   blocking request/response pairs used to fetch missing ancestors and
//!   transactions (with a hard timeout).
//! - [`NodeInbox`]: held by the orchestrator's handler threads. Inbound
//!   gossip, one channel per payload kind.
//! - [`TransportHandle`]: the far ends, owned by whatever peers the node
//!   to the network (or by tests acting as the network).
//!
//! Packet framing prepends a 1-byte message kind to the payload.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Duration;

use crate::types::{
    AccTx, AggTx, ConfigTx, FundsTx, Hash256, IotTx, StakeTx, Transaction, TxKind,
};

/// One-byte message kinds used by the packet framing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgKind {
    BlockBrdcst = 1,
    BlockHeaderBrdcst = 2,
    VerifiedTxBrdcst = 3,
    BlockReq = 4,
    TxReq = 5,
}

/// Prepends the 1-byte message kind to `payload`.
pub fn build_packet(kind: MsgKind, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + payload.len());
    packet.push(kind as u8);
    packet.extend_from_slice(payload);
    packet
}

/// Splits a packet into its kind byte and payload.
pub fn parse_packet(packet: &[u8]) -> Option<(u8, &[u8])> {
    let (&kind, payload) = packet.split_first()?;
    Some((kind, payload))
}

/// Correlated ancestor-fetch request carrying both parent hashes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRequest {
    pub hash: Hash256,
    pub hash_without_tx: Hash256,
}

/// Targeted fetch request for a missing transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxRequest {
    pub kind: TxKind,
    pub hash: Hash256,
}

/// Engine-side bus handle: broadcasts out, fetch responses in.
pub struct NetHandle {
    block_out: Sender<Vec<u8>>,
    block_header_out: Sender<Vec<u8>>,
    verified_txs_out: Sender<Vec<u8>>,
    block_req_out: Sender<BlockRequest>,
    tx_req_out: Sender<TxRequest>,
    block_res_in: Receiver<Vec<u8>>,
    funds_res_in: Receiver<FundsTx>,
    acc_res_in: Receiver<AccTx>,
    config_res_in: Receiver<ConfigTx>,
    stake_res_in: Receiver<StakeTx>,
    agg_res_in: Receiver<AggTx>,
    iot_res_in: Receiver<IotTx>,
}

impl NetHandle {
    /// Broadcasts an encoded block to the peers.
    pub fn broadcast_block(&self, encoded: Vec<u8>) {
        let _ = self.block_out.send(build_packet(MsgKind::BlockBrdcst, &encoded));
    }

    /// Publishes an encoded block header for light clients.
    pub fn broadcast_block_header(&self, encoded: Vec<u8>) {
        let _ = self
            .block_header_out
            .send(build_packet(MsgKind::BlockHeaderBrdcst, &encoded));
    }

    /// Publishes transactions the node has validated.
    pub fn broadcast_verified_txs(&self, encoded: Vec<u8>) {
        let _ = self
            .verified_txs_out
            .send(build_packet(MsgKind::VerifiedTxBrdcst, &encoded));
    }

    /// Emits an ancestor-fetch request.
    pub fn request_block(&self, hash: Hash256, hash_without_tx: Hash256) {
        let _ = self.block_req_out.send(BlockRequest {
            hash,
            hash_without_tx,
        });
    }

    /// Blocking wait for the next ancestor-fetch response.
    pub fn await_block(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.block_res_in.recv_timeout(timeout).ok()
    }

    /// Emits a targeted transaction-fetch request.
    pub fn request_tx(&self, kind: TxKind, hash: Hash256) {
        let _ = self.tx_req_out.send(TxRequest { kind, hash });
    }

    /// Blocking wait on the typed channel matching `kind`.
    pub fn await_tx(&self, kind: TxKind, timeout: Duration) -> Option<Transaction> {
        match kind {
            TxKind::Funds => self
                .funds_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Funds),
            TxKind::Acc => self
                .acc_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Acc),
            TxKind::Config => self
                .config_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Config),
            TxKind::Stake => self
                .stake_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Stake),
            TxKind::Agg => self
                .agg_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Agg),
            TxKind::Iot => self
                .iot_res_in
                .recv_timeout(timeout)
                .ok()
                .map(Transaction::Iot),
        }
    }
}

/// Inbound gossip, consumed by the orchestrator's handler threads.
pub struct NodeInbox {
    pub block_in: Receiver<Vec<u8>>,
    pub funds_in: Receiver<FundsTx>,
    pub acc_in: Receiver<AccTx>,
    pub config_in: Receiver<ConfigTx>,
    pub stake_in: Receiver<StakeTx>,
    pub agg_in: Receiver<AggTx>,
    pub iot_in: Receiver<IotTx>,
}

/// The transport layer's ends of every channel.
pub struct TransportHandle {
    pub block_out: Receiver<Vec<u8>>,
    pub block_header_out: Receiver<Vec<u8>>,
    pub verified_txs_out: Receiver<Vec<u8>>,
    pub block_req_out: Receiver<BlockRequest>,
    pub tx_req_out: Receiver<TxRequest>,
    pub block_res: Sender<Vec<u8>>,
    pub funds_res: Sender<FundsTx>,
    pub acc_res: Sender<AccTx>,
    pub config_res: Sender<ConfigTx>,
    pub stake_res: Sender<StakeTx>,
    pub agg_res: Sender<AggTx>,
    pub iot_res: Sender<IotTx>,
    pub block_in: Sender<Vec<u8>>,
    pub funds_in: Sender<FundsTx>,
    pub acc_in: Sender<AccTx>,
    pub config_in: Sender<ConfigTx>,
    pub stake_in: Sender<StakeTx>,
    pub agg_in: Sender<AggTx>,
    pub iot_in: Sender<IotTx>,
}

/// Creates the full channel set.
///
/// Tests keep the [`TransportHandle`] and play the network; a node wires
/// it into the real peer layer.
pub fn channels() -> (NetHandle, NodeInbox, TransportHandle) {
    let (block_out_tx, block_out_rx) = channel();
    let (header_out_tx, header_out_rx) = channel();
    let (verified_out_tx, verified_out_rx) = channel();
    let (block_req_tx, block_req_rx) = channel();
    let (tx_req_tx, tx_req_rx) = channel();
    let (block_res_tx, block_res_rx) = channel();
    let (funds_res_tx, funds_res_rx) = channel();
    let (acc_res_tx, acc_res_rx) = channel();
    let (config_res_tx, config_res_rx) = channel();
    let (stake_res_tx, stake_res_rx) = channel();
    let (agg_res_tx, agg_res_rx) = channel();
    let (iot_res_tx, iot_res_rx) = channel();
    let (block_in_tx, block_in_rx) = channel();
    let (funds_in_tx, funds_in_rx) = channel();
    let (acc_in_tx, acc_in_rx) = channel();
    let (config_in_tx, config_in_rx) = channel();
    let (stake_in_tx, stake_in_rx) = channel();
    let (agg_in_tx, agg_in_rx) = channel();
    let (iot_in_tx, iot_in_rx) = channel();

    let net = NetHandle {
        block_out: block_out_tx,
        block_header_out: header_out_tx,
        verified_txs_out: verified_out_tx,
        block_req_out: block_req_tx,
        tx_req_out: tx_req_tx,
        block_res_in: block_res_rx,
        funds_res_in: funds_res_rx,
        acc_res_in: acc_res_rx,
        config_res_in: config_res_rx,
        stake_res_in: stake_res_rx,
        agg_res_in: agg_res_rx,
        iot_res_in: iot_res_rx,
    };

    let inbox = NodeInbox {
        block_in: block_in_rx,
        funds_in: funds_in_rx,
        acc_in: acc_in_rx,
        config_in: config_in_rx,
        stake_in: stake_in_rx,
        agg_in: agg_in_rx,
        iot_in: iot_in_rx,
    };

    let transport = TransportHandle {
        block_out: block_out_rx,
        block_header_out: header_out_rx,
        verified_txs_out: verified_out_rx,
        block_req_out: block_req_rx,
        tx_req_out: tx_req_rx,
        block_res: block_res_tx,
        funds_res: funds_res_tx,
        acc_res: acc_res_tx,
        config_res: config_res_tx,
        stake_res: stake_res_tx,
        agg_res: agg_res_tx,
        iot_res: iot_res_tx,
        block_in: block_in_tx,
        funds_in: funds_in_tx,
        acc_in: acc_in_tx,
        config_in: config_in_tx,
        stake_in: stake_in_tx,
        agg_in: agg_in_tx,
        iot_in: iot_in_tx,
    };

    (net, inbox, transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, HASH_LEN};

    fn dummy_hash(byte: u8) -> Hash256 {
        Hash256([byte; HASH_LEN])
    }

    #[test]
    fn packet_framing_roundtrips() {
        let packet = build_packet(MsgKind::BlockBrdcst, b"payload");
        let (kind, payload) = parse_packet(&packet).expect("non-empty packet");
        assert_eq!(kind, MsgKind::BlockBrdcst as u8);
        assert_eq!(payload, b"payload");
        assert!(parse_packet(&[]).is_none());
    }

    #[test]
    fn block_fetch_roundtrip() {
        let (net, _inbox, transport) = channels();
        net.request_block(dummy_hash(1), dummy_hash(2));

        let req = transport.block_req_out.try_recv().expect("request visible");
        assert_eq!(req.hash, dummy_hash(1));

        transport.block_res.send(vec![9, 9, 9]).expect("send response");
        let res = net.await_block(Duration::from_millis(100)).expect("response");
        assert_eq!(res, vec![9, 9, 9]);
    }

    #[test]
    fn tx_fetch_uses_the_typed_channel() {
        let (net, _inbox, transport) = channels();
        net.request_tx(TxKind::Funds, dummy_hash(3));
        assert_eq!(
            transport.tx_req_out.try_recv().expect("request").kind,
            TxKind::Funds
        );

        let tx = FundsTx::new(1, 1, 0, AccountId(dummy_hash(1)), AccountId(dummy_hash(2)));
        transport.funds_res.send(tx.clone()).expect("send tx");

        match net.await_tx(TxKind::Funds, Duration::from_millis(100)) {
            Some(Transaction::Funds(got)) => assert_eq!(got, tx),
            other => panic!("unexpected fetch result: {other:?}"),
        }
    }

    #[test]
    fn await_times_out_when_nothing_arrives() {
        let (net, _inbox, _transport) = channels();
        assert!(net.await_block(Duration::from_millis(10)).is_none());
        assert!(net.await_tx(TxKind::Iot, Duration::from_millis(10)).is_none());
    }
}
