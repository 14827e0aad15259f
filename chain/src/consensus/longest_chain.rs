//! Longest-chain resolution.
//!
//! Given an incoming block that does not extend the head, find the split
//! point with the local chain and produce the two work lists: blocks to
//! roll back (head toward ancestor) and blocks to apply (ancestor toward
//! leaf). Missing ancestors are requested from the network, with a hard
//! timeout converting into a soft-transport error.
//!
//! Decision rule: the new chain is adopted iff it is strictly longer
//! than the part of the local chain it would replace. Ties go to the
//! incumbent.

use crate::storage::ChainStore;
use crate::types::Block;

use super::engine::ChainEngine;
use super::error::{ChainError, ValidationError};

impl<S: ChainStore> ChainEngine<S> {
    /// Returns `(blocks_to_rollback, blocks_to_apply)` for an incoming
    /// non-extension block, or an error when the incoming chain loses.
    pub(crate) fn block_sequences(
        &mut self,
        new_block: &Block,
    ) -> Result<(Vec<Block>, Vec<Block>), ChainError> {
        let (ancestor, new_chain) = self.new_chain(new_block)?;

        // Count the blocks on the active chain above the ancestor.
        let mut to_rollback = Vec::new();
        let mut tmp = self.last_block.clone();
        while tmp.hash != ancestor.hash {
            to_rollback.push(tmp.clone());
            tmp = self.store.read_closed_block(&tmp.prev_hash).ok_or_else(|| {
                ChainError::Critical("active chain has a gap in closed storage".to_string())
            })?;
        }

        if to_rollback.len() >= new_chain.len() {
            return Err(ValidationError::Custom(format!(
                "block belongs to a chain no longer than ours ({} to roll back vs {} to apply)",
                to_rollback.len(),
                new_chain.len()
            ))
            .into());
        }
        Ok((to_rollback, new_chain))
    }

    /// Walks the incoming chain backwards until a locally closed
    /// ancestor appears, fetching unknown links from the network.
    ///
    /// Returns the ancestor and the new chain ordered from the ancestor
    /// (exclusive) toward the leaf (inclusive).
    fn new_chain(&mut self, block: &Block) -> Result<(Block, Vec<Block>), ChainError> {
        let timeout = self.cfg.block_fetch_timeout;
        let mut chain = Vec::new();
        let mut cur = block.clone();

        loop {
            chain.push(cur.clone());

            // A closed parent is the common ancestor; the walk went back
            // in time, so the chain reverses into application order.
            if let Some(ancestor) = self.store.read_closed_block(&cur.prev_hash) {
                chain.reverse();
                return Ok((ancestor, chain));
            }
            if let Some(ancestor) = self
                .store
                .read_closed_block_without_tx(&cur.prev_hash_without_tx)
            {
                chain.reverse();
                return Ok((ancestor, chain));
            }

            // A sync may already have staged the parent.
            if let Some(open) = self.store.read_open_block(&cur.prev_hash) {
                cur = open;
                continue;
            }

            // Blocks from earlier rollbacks wait in the received stash.
            if let Some(stashed) = self
                .store
                .read_received_block_stash()
                .into_iter()
                .find(|s| s.hash == cur.prev_hash)
            {
                cur = stashed;
                continue;
            }

            // Fetch the link we are missing from the network.
            self.net.request_block(cur.prev_hash, cur.prev_hash_without_tx);
            match self.net.await_block(timeout) {
                Some(encoded) => {
                    let fetched = Block::decode(&encoded).ok_or(ValidationError::Invalid(
                        "undecodable block in fetch response",
                    ))?;
                    if fetched.hash != cur.prev_hash || fetched.compute_hash() != fetched.hash {
                        return Err(ValidationError::Invalid(
                            "fetched block does not match the requested ancestor",
                        )
                        .into());
                    }
                    // Keep it in the stash in case of repeated rollbacks.
                    self.store.write_to_received_stash(fetched.clone());
                    cur = fetched;
                }
                None => {
                    return Err(ChainError::Transport(
                        "common ancestor not found before the fetch timeout".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::testutil::TestChain;
    use crate::types::{HASH_LEN, Hash256, Sig};

    #[test]
    fn extension_never_reaches_the_resolver() {
        let mut chain = TestChain::new();
        let b1 = chain.mine();
        assert_eq!(chain.engine.last_block().hash, b1.hash);
        assert_eq!(chain.engine.last_block().height, 1);
    }

    #[test]
    fn equal_length_competitor_is_rejected() {
        // S3: a competing block at the same height never displaces the
        // incumbent.
        let mut chain = TestChain::new();
        let b1 = chain.mine();

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 7);
        let err = chain.engine.validate(b1_prime, true).unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
        assert_eq!(chain.engine.last_block().hash, b1.hash);
    }

    #[test]
    fn strictly_longer_chain_is_adopted() {
        // P5: peer chain of length 2 displaces a local chain of length 1.
        let mut chain = TestChain::new();
        let b1 = chain.mine();

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 7);
        let b2_prime = chain.build_empty_on(&b1_prime, 8);

        // The resolver will have to fetch the unknown middle link.
        chain
            .transport
            .block_res
            .send(b1_prime.encode())
            .expect("queue ancestor response");

        chain.engine.validate(b2_prime.clone(), true).expect("reorg");
        assert_eq!(chain.engine.last_block().hash, b2_prime.hash);
        assert_eq!(chain.engine.last_block().height, 2);

        // The losing block waits in the received stash.
        let stash = chain.engine.store().read_received_block_stash();
        assert!(stash.iter().any(|s| s.hash == b1.hash));
    }

    #[test]
    fn missing_ancestor_times_out_and_discards_the_block() {
        // S6: nobody answers the fetch; the block is discarded and the
        // head stays put.
        let mut chain = TestChain::new();
        let b1 = chain.mine();

        let mut phantom_parent = Block::new(
            Hash256([9u8; HASH_LEN]),
            Hash256([9u8; HASH_LEN]),
            Sig::default(),
            1,
        );
        phantom_parent.seal();
        let orphan = chain.build_empty_on(&phantom_parent, 3);

        let err = chain.engine.validate(orphan, true).unwrap_err();
        assert!(matches!(err, ChainError::Transport(_)));
        assert_eq!(chain.engine.last_block().hash, b1.hash);
        assert!(!chain.engine.is_halted());
    }

    #[test]
    fn forks_are_rejected_while_not_rollback_safe() {
        let mut chain = TestChain::new();
        chain.mine();

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 7);
        let b2_prime = chain.build_empty_on(&b1_prime, 8);

        let err = chain.engine.validate(b2_prime, false).unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
        assert_eq!(chain.engine.last_block().height, 1);
    }

    #[test]
    fn stashed_links_resolve_without_network_fetches() {
        let mut chain = TestChain::new();
        chain.mine();

        let genesis = Block::genesis();
        let b1_prime = chain.build_empty_on(&genesis, 7);
        let b2_prime = chain.build_empty_on(&b1_prime, 8);

        // The middle link is already in the stash; no response queued.
        chain
            .engine
            .store_mut()
            .write_to_received_stash(b1_prime.clone());

        chain.engine.validate(b2_prime.clone(), true).expect("reorg");
        assert_eq!(chain.engine.last_block().hash, b2_prime.hash);
    }
}
