//! The header-tree view of the chain, and the collaborator seams.
//!
//! The core keeps its own index of every header it has accepted: heights,
//! cumulative work, skip-list ancestors, and which entries carry block data.
//! Consensus judgment (is this header/block/transaction valid?) stays behind
//! the [`Validator`] trait; the index only records the outcomes.

use std::collections::HashMap;
use vireo_net::RejectCode;
use vireo_types::{
    Block, BlockHeader, Hash256, Locator, NetAddress, OutPoint, ServiceTransaction, Transaction,
};

/// Token identifying an entry in the [`ChainIndex`] arena. Tokens are never
/// reused or invalidated while the core lives, so they are safe to store in
/// per-peer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry of the header tree.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub hash: Hash256,
    pub prev: Option<BlockId>,
    skip: Option<BlockId>,
    pub height: u32,
    /// Cumulative chain work up to and including this header.
    pub work: u128,
    /// Block timestamp, unix seconds.
    pub time: i64,
    /// Full block data is on disk.
    pub have_data: bool,
    /// All ancestors have data too.
    pub have_chain_txs: bool,
    /// Scripts were validated (the entry connected at some point).
    pub valid_scripts: bool,
    /// Header or a descendant failed validation.
    pub failed: bool,
}

/// Height the skip pointer of a header at `height` points to.
fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    let invert = |n: u32| n & n.wrapping_sub(1);
    if height & 1 == 1 {
        invert(invert(height - 1)) + 1
    } else {
        invert(height)
    }
}

/// The header tree plus the active chain.
pub struct ChainIndex {
    entries: Vec<BlockEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    /// `active[height]` is the active-chain entry at that height.
    active: Vec<BlockId>,
    /// Most-work header we know of, regardless of data availability.
    best_header: BlockId,
}

impl ChainIndex {
    /// Start an index from the genesis header.
    pub fn new(genesis: BlockHeader) -> Self {
        let entry = BlockEntry {
            hash: genesis.hash,
            prev: None,
            skip: None,
            height: 0,
            work: 1,
            time: genesis.time,
            have_data: true,
            have_chain_txs: true,
            valid_scripts: true,
            failed: false,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, BlockId(0));
        Self {
            entries: vec![entry],
            by_hash,
            active: vec![BlockId(0)],
            best_header: BlockId(0),
        }
    }

    pub fn get(&self, id: BlockId) -> &BlockEntry {
        &self.entries[id.index()]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockEntry {
        &mut self.entries[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    /// Insert a header whose parent is already indexed. `work` is the work
    /// of this header alone; the entry stores the cumulative sum.
    pub fn insert_header(&mut self, header: BlockHeader, prev: BlockId, work: u128) -> BlockId {
        if let Some(existing) = self.lookup(&header.hash) {
            return existing;
        }
        let height = self.get(prev).height + 1;
        let cumulative = self.get(prev).work + work;
        let skip = self.ancestor(prev, skip_height(height));
        let id = BlockId(self.entries.len() as u32);
        self.entries.push(BlockEntry {
            hash: header.hash,
            prev: Some(prev),
            skip,
            height,
            work: cumulative,
            time: header.time,
            have_data: false,
            have_chain_txs: false,
            valid_scripts: false,
            failed: false,
        });
        self.by_hash.insert(header.hash, id);
        if cumulative > self.get(self.best_header).work {
            self.best_header = id;
        }
        id
    }

    pub fn best_header(&self) -> BlockId {
        self.best_header
    }

    pub fn tip(&self) -> BlockId {
        *self.active.last().expect("active chain has genesis")
    }

    pub fn tip_entry(&self) -> &BlockEntry {
        self.get(self.tip())
    }

    pub fn genesis(&self) -> BlockId {
        self.active[0]
    }

    /// Height of the active chain tip.
    pub fn height(&self) -> u32 {
        (self.active.len() - 1) as u32
    }

    /// Active-chain entry at a height, if any.
    pub fn active_at(&self, height: u32) -> Option<BlockId> {
        self.active.get(height as usize).copied()
    }

    /// Whether an entry is on the active chain.
    pub fn contains(&self, id: BlockId) -> bool {
        self.active_at(self.get(id).height) == Some(id)
    }

    /// The active-chain successor of an entry.
    pub fn next_in_active(&self, id: BlockId) -> Option<BlockId> {
        if !self.contains(id) {
            return None;
        }
        self.active_at(self.get(id).height + 1)
    }

    /// Ancestor of `id` at `height`, following skip pointers where they help.
    pub fn ancestor(&self, mut id: BlockId, height: u32) -> Option<BlockId> {
        if height > self.get(id).height {
            return None;
        }
        while self.get(id).height > height {
            let entry = self.get(id);
            if let Some(skip) = entry.skip {
                if self.get(skip).height >= height {
                    id = skip;
                    continue;
                }
            }
            id = entry.prev?;
        }
        Some(id)
    }

    /// The deepest entry on both branches.
    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId {
        let height = self.get(a).height.min(self.get(b).height);
        let mut a = self.ancestor(a, height).expect("height clamped");
        let mut b = self.ancestor(b, height).expect("height clamped");
        while a != b {
            match (self.get(a).prev, self.get(b).prev) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                // Both branches root at genesis.
                _ => return self.genesis(),
            }
        }
        a
    }

    /// Build a locator walking back from `from` with exponentially growing
    /// steps.
    pub fn locator_from(&self, from: BlockId) -> Locator {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1u32;
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let entry = self.get(id);
            hashes.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            let next_height = entry.height.saturating_sub(step);
            cursor = self.ancestor(id, next_height);
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        Locator::new(hashes)
    }

    /// Locator anchored at our best header.
    pub fn locator(&self) -> Locator {
        self.locator_from(self.best_header)
    }

    /// The most recent entry of the locator that lies on our active chain;
    /// genesis if none does.
    pub fn find_fork(&self, locator: &Locator) -> BlockId {
        for hash in &locator.hashes {
            if let Some(id) = self.lookup(hash) {
                if self.contains(id) {
                    return id;
                }
            }
        }
        self.genesis()
    }

    /// Replace the active chain with the branch ending at `tip`. Entries on
    /// the new branch are known to have connected, so they gain data flags.
    pub fn set_active_tip(&mut self, tip: BlockId) {
        let mut branch = Vec::with_capacity(self.get(tip).height as usize + 1);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            branch.push(id);
            cursor = self.get(id).prev;
        }
        branch.reverse();
        for &id in &branch {
            let entry = self.get_mut(id);
            entry.have_data = true;
            entry.have_chain_txs = true;
            entry.valid_scripts = true;
        }
        self.active = branch;
        if self.get(tip).work > self.get(self.best_header).work {
            self.best_header = tip;
        }
    }

    /// Record that a block's data arrived and was accepted.
    pub fn mark_block_data(&mut self, id: BlockId) {
        let prev_chain_txs = self
            .get(id)
            .prev
            .map(|prev| self.get(prev).have_chain_txs)
            .unwrap_or(true);
        let entry = self.get_mut(id);
        entry.have_data = true;
        if prev_chain_txs {
            entry.have_chain_txs = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a header, block or transaction was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// Wire reject code; `None` for internal codes that never leave the node.
    pub code: Option<RejectCode>,
    pub reason: String,
    /// Misbehavior to apply to the source peer.
    pub dos: u32,
    /// The payload may have been malleated in transit; do not cache the
    /// rejection against its hash.
    pub malleated: bool,
}

impl ValidationFailure {
    pub fn new(code: RejectCode, reason: &str, dos: u32) -> Self {
        Self {
            code: Some(code),
            reason: reason.to_owned(),
            dos,
            malleated: false,
        }
    }

    /// A failure with an internal code: logged and scored, never sent.
    pub fn internal(reason: &str, dos: u32) -> Self {
        Self {
            code: None,
            reason: reason.to_owned(),
            dos,
            malleated: false,
        }
    }
}

/// Outcome of submitting a transaction to the mempool.
#[derive(Debug, Clone, PartialEq)]
pub enum TxVerdict {
    Accepted,
    /// Inputs are unknown; the transaction may be an orphan.
    MissingInputs,
    Invalid(ValidationFailure),
}

/// Outcome of submitting a block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockVerdict {
    /// Accepted and stored; `work` is the work of the header alone.
    Accepted { work: u128 },
    Invalid(ValidationFailure),
}

/// Consensus-facing collaborator: validates headers, blocks and transactions
/// and answers chain-state questions the core cannot.
pub trait Validator: Send + Sync {
    /// Judge a header on its own; returns the work it contributes.
    fn check_header(&self, header: &BlockHeader) -> Result<u128, ValidationFailure>;

    /// Validate a block and hand it to storage/consensus. `force` processes
    /// it even when unrequested.
    fn submit_block(&self, block: &Block, force: bool) -> BlockVerdict;

    /// Validate a transaction and admit it to the mempool.
    fn accept_transaction(&self, tx: &Transaction) -> TxVerdict;

    /// Validate a service transaction against its payment transaction and
    /// execute the service command.
    fn accept_service_transaction(
        &self,
        stx: &ServiceTransaction,
        payment: &Transaction,
    ) -> Result<(), ValidationFailure>;

    /// Look a transaction up in the mempool or the chain.
    fn get_transaction(&self, hash: &Hash256) -> Option<Transaction>;

    /// Whether the node is still catching up from near-genesis.
    fn is_initial_block_download(&self) -> bool;

    /// Network-adjusted clock, unix seconds.
    fn adjusted_time(&self) -> i64;
}

/// Read-only mempool queries.
pub trait MempoolView: Send + Sync {
    fn exists(&self, hash: &Hash256) -> bool;
    fn get(&self, hash: &Hash256) -> Option<Transaction>;
    fn tx_hashes(&self) -> Vec<Hash256>;
}

/// The service-transaction pool.
pub trait ServiceTxPool: Send + Sync {
    fn add(&self, stx: &ServiceTransaction);
    fn exists(&self, hash: &Hash256) -> bool;
    fn get(&self, hash: &Hash256) -> Option<ServiceTransaction>;
}

/// Coin-cache probe used by `already_have` for transaction inventory.
pub trait CoinView: Send + Sync {
    fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool;
}

/// The address manager.
pub trait AddrBook: Send + Sync {
    fn len(&self) -> usize;
    fn add(&self, addrs: Vec<NetAddress>, source: &NetAddress);
    fn mark_good(&self, addr: &NetAddress);
    /// Sampled addresses for a `getaddr` response.
    fn select_for_getaddr(&self) -> Vec<NetAddress>;
    /// Our own address as this peer would see it, if advertisable.
    fn local_address(&self, peer: &NetAddress) -> Option<NetAddress>;
    fn is_reachable(&self, addr: &NetAddress) -> bool;
}

/// Disk block reads for serving getdata.
pub trait BlockStore: Send + Sync {
    fn read_block(&self, hash: &Hash256) -> Option<Block>;
}

/// Wallet rebroadcast hook, kicked from the outbound tick when out of IBD.
pub trait WalletBroadcast: Send + Sync {
    fn resend(&self, best_received_time: i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(n: u64, prev: u64) -> BlockHeader {
        BlockHeader::new(Hash256::from_u64(n), Hash256::from_u64(prev), n as i64 * 180)
    }

    /// Genesis plus a linear chain of `n` headers, all active.
    fn linear_chain(n: u64) -> ChainIndex {
        let mut chain = ChainIndex::new(header(0, u64::MAX));
        let mut prev = chain.genesis();
        let mut tip = prev;
        for h in 1..=n {
            let id = chain.insert_header(header(h, h - 1), prev, 2);
            prev = id;
            tip = id;
        }
        chain.set_active_tip(tip);
        chain
    }

    #[test]
    fn heights_and_work_accumulate() {
        let chain = linear_chain(10);
        assert_eq!(chain.height(), 10);
        let tip = chain.tip_entry();
        assert_eq!(tip.height, 10);
        assert_eq!(tip.work, 1 + 10 * 2);
    }

    #[test]
    fn ancestor_walks_with_skips() {
        let chain = linear_chain(1000);
        let tip = chain.tip();
        for height in [0u32, 1, 9, 127, 512, 999, 1000] {
            let id = chain.ancestor(tip, height).unwrap();
            assert_eq!(chain.get(id).height, height);
        }
        assert!(chain.ancestor(chain.genesis(), 1).is_none());
    }

    #[test]
    fn last_common_ancestor_of_fork() {
        let mut chain = linear_chain(5);
        // Fork off height 3.
        let fork_parent = chain.active_at(3).unwrap();
        let side = chain.insert_header(header(100, 3), fork_parent, 2);
        let side2 = chain.insert_header(header(101, 100), side, 2);

        let lca = chain.last_common_ancestor(chain.tip(), side2);
        assert_eq!(lca, fork_parent);
        assert_eq!(chain.last_common_ancestor(side2, side2), side2);
    }

    #[test]
    fn locator_is_exponential_and_ends_at_genesis() {
        let chain = linear_chain(200);
        let locator = chain.locator();
        assert_eq!(locator.hashes[0], chain.tip_entry().hash);
        assert_eq!(*locator.hashes.last().unwrap(), chain.get(chain.genesis()).hash);
        assert!(locator.hashes.len() < 30);
    }

    #[test]
    fn find_fork_prefers_active_entries() {
        let mut chain = linear_chain(5);
        let fork_parent = chain.active_at(3).unwrap();
        let side = chain.insert_header(header(100, 3), fork_parent, 2);

        let locator = Locator::new(vec![chain.get(side).hash, chain.get(fork_parent).hash]);
        assert_eq!(chain.find_fork(&locator), fork_parent);

        let unknown = Locator::new(vec![Hash256::from_u64(999)]);
        assert_eq!(chain.find_fork(&unknown), chain.genesis());
    }

    #[test]
    fn reorg_switches_active_chain() {
        let mut chain = linear_chain(4);
        let fork_parent = chain.active_at(2).unwrap();
        let a = chain.insert_header(header(100, 2), fork_parent, 10);
        let b = chain.insert_header(header(101, 100), a, 10);

        chain.set_active_tip(b);
        assert_eq!(chain.height(), 4);
        assert_eq!(chain.tip(), b);
        assert!(chain.contains(a));
        assert!(!chain.contains(chain.lookup(&Hash256::from_u64(3)).unwrap()));
    }

    #[test]
    fn duplicate_insert_returns_existing() {
        let mut chain = linear_chain(2);
        let genesis = chain.genesis();
        let existing = chain.lookup(&Hash256::from_u64(1)).unwrap();
        assert_eq!(chain.insert_header(header(1, 0), genesis, 2), existing);
        assert_eq!(chain.len(), 3);
    }
}
