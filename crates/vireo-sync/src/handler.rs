//! Inbound message dispatch: one handler per message kind.

use crate::chain::{BlockId, BlockVerdict, TxVerdict};
use crate::error::{SyncError, SyncResult};
use crate::processor::ProtocolCore;
use crate::state::CoreState;
use crate::{GETBLOCKS_LIMIT, MAX_BLOCKS_IN_TRANSIT_PER_PEER};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, trace};
use vireo_net::{
    FilterLoad, Message, Peer, PeerFilter, Reject, RejectCode, VersionMessage, MAX_ADDR_SZ,
    MAX_HEADERS_RESULTS, MAX_INV_SZ, MAX_SUBVERSION_LENGTH, MIN_PROTO_VERSION, NO_BLOOM_VERSION,
    PROTOCOL_VERSION, SENDHEADERS_VERSION,
};
use vireo_types::{
    Block, BlockHeader, Hash256, Inv, InvKind, Locator, NetAddress, PeerId, ServiceTransaction,
    Transaction, NODE_BLOOM, NODE_NETWORK,
};

impl ProtocolCore {
    /// Process one message from a peer. Errors describe why a message was
    /// rejected; the connection survives unless a disconnect condition or
    /// the ban threshold fired along the way.
    pub fn handle_message(&self, peer_id: PeerId, message: Message, now_us: i64) -> SyncResult<()> {
        let peer = self
            .peer(peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;

        // Serve leftover getdata work first so responses keep request order.
        if !peer.getdata_queue.lock().is_empty() {
            self.process_getdata(&peer, now_us);
        }

        trace!(peer = %peer_id, command = message.command(), "received message");

        if self.config.drop_messages_test > 0
            && rand::thread_rng().gen_range(0..self.config.drop_messages_test) == 0
        {
            debug!("dropping received message for testing");
            return Ok(());
        }

        let result = self.dispatch(&peer, message, now_us);

        if self.interrupted() {
            return result;
        }
        let mut state = self.lock_state();
        self.flush_rejects_and_maybe_ban(&mut state, &peer);
        result
    }

    fn dispatch(&self, peer: &Peer, message: Message, now_us: i64) -> SyncResult<()> {
        // Filter traffic against a non-bloom node.
        if !self.local_services.includes(NODE_BLOOM)
            && matches!(
                message,
                Message::FilterLoad(_) | Message::FilterAdd(_) | Message::FilterClear
            )
        {
            if peer.version() >= NO_BLOOM_VERSION {
                self.lock_state()
                    .misbehaving(peer.id, 100, "no-bloom-version", self.config.banscore);
                return Ok(());
            } else if self.config.enforce_node_bloom {
                peer.request_disconnect();
                return Ok(());
            }
        }

        if !matches!(message, Message::Version(_)) && peer.version() == 0 {
            // Must have a version message before anything else.
            self.lock_state()
                .misbehaving(peer.id, 1, "missing-version", self.config.banscore);
            return Err(SyncError::MissingVersion);
        }

        match message {
            Message::Version(version) => self.handle_version(peer, version, now_us),
            Message::Verack => self.handle_verack(peer),
            Message::Addr(addrs) => self.handle_addr(peer, addrs, now_us),
            Message::SendHeaders => {
                let mut state = self.lock_state();
                if let Some(peer_state) = state.peer_mut(peer.id) {
                    peer_state.prefer_headers = true;
                }
                Ok(())
            }
            Message::Inv(invs) => self.handle_inv(peer, invs, now_us),
            Message::GetData(invs) => self.handle_getdata(peer, invs, now_us),
            Message::GetBlocks { locator, stop } => self.handle_getblocks(peer, locator, stop),
            Message::GetHeaders { locator, stop } => self.handle_getheaders(peer, locator, stop),
            Message::Headers(headers) => self.handle_headers(peer, headers, now_us),
            Message::Tx(tx) => self.handle_tx(peer, tx, now_us),
            Message::Block(block) => self.handle_block(peer, block, now_us),
            Message::ServiceTx(stx) => self.handle_service_tx(peer, stx, now_us),
            Message::GetAddr => self.handle_getaddr(peer),
            Message::Mempool => self.handle_mempool(peer),
            Message::Ping(nonce) => {
                // Echo the nonce so the peer can match the reply to its probe.
                self.out.send(peer.id, Message::Pong(nonce));
                Ok(())
            }
            Message::Pong(nonce) => self.handle_pong(peer, nonce, now_us),
            Message::FilterLoad(filter) => self.handle_filterload(peer, filter),
            Message::FilterAdd(data) => self.handle_filteradd(peer, data),
            Message::FilterClear => {
                *peer.filter.lock() = Some(PeerFilter::empty());
                peer.set_relay_txes(true);
                Ok(())
            }
            Message::Reject(reject) => {
                // Parsed for debugging only; never replied to.
                debug!(
                    peer = %peer.id,
                    command = %reject.message,
                    code = ?reject.code,
                    reason = %reject.reason,
                    "reject received"
                );
                Ok(())
            }
            Message::NotFound(_) | Message::MerkleBlock(_) => Ok(()),
            Message::Unknown(command) => {
                // Ignore unknown commands for extensibility.
                debug!(peer = %peer.id, command = %command, "unknown command");
                Ok(())
            }
        }
    }

    // --- handshake ---

    fn handle_version(&self, peer: &Peer, version: VersionMessage, _now_us: i64) -> SyncResult<()> {
        // Each connection can only send one version message.
        if peer.version() != 0 {
            self.out.send(
                peer.id,
                Message::Reject(Reject::new(
                    "version",
                    RejectCode::Duplicate,
                    "Duplicate version message",
                    None,
                )),
            );
            self.lock_state()
                .misbehaving(peer.id, 1, "multiple-version", self.config.banscore);
            return Err(SyncError::DuplicateVersion);
        }

        let send_version = version.version.min(PROTOCOL_VERSION);

        let expected = self.expected_services(peer);
        if !version.services.includes(expected) {
            info!(
                peer = %peer.id,
                offered = %version.services,
                expected = %expected,
                "peer does not offer the expected services; disconnecting"
            );
            self.out.send(
                peer.id,
                Message::Reject(Reject::new(
                    "version",
                    RejectCode::Nonstandard,
                    &format!("Expected to offer services {}", expected),
                    None,
                )),
            );
            peer.request_disconnect();
            return Ok(());
        }

        if version.version < MIN_PROTO_VERSION {
            // Disconnect from peers older than this proto version.
            info!(peer = %peer.id, version = version.version, "using obsolete version; disconnecting");
            self.out.send(
                peer.id,
                Message::Reject(Reject::new(
                    "version",
                    RejectCode::Obsolete,
                    &format!("Version must be {} or greater", MIN_PROTO_VERSION),
                    None,
                )),
            );
            peer.request_disconnect();
            return Ok(());
        }

        // Disconnect if we connected to ourself.
        if peer.flags.inbound {
            let state = self.lock_state();
            if self.is_local_nonce(&state, version.nonce) {
                info!(addr = %peer.addr_name, "connected to self, disconnecting");
                peer.request_disconnect();
                return Ok(());
            }
        }

        // Be shy and don't send version until we hear.
        if peer.flags.inbound {
            self.push_version(peer);
        }

        self.out.send(peer.id, Message::Verack);

        peer.set_services(version.services);
        let mut subversion = version.subversion;
        subversion.truncate(MAX_SUBVERSION_LENGTH);
        peer.set_subversion(subversion.clone());
        peer.set_start_height(version.start_height);
        peer.set_relay_txes(version.relay);
        peer.set_send_version(send_version);
        peer.set_version(version.version);

        // Potentially mark this peer as a preferred download peer.
        {
            let mut state = self.lock_state();
            let preferred = (!peer.flags.inbound || peer.flags.whitelisted)
                && !peer.flags.one_shot
                && !peer.is_client();
            state.update_preferred_download(peer.id, preferred);
        }

        if !peer.flags.inbound {
            // Advertise our address.
            if self.config.listen && !self.validator.is_initial_block_download() {
                if let Some(local) = self.addr_book.local_address(&peer.addr) {
                    if local.is_routable() {
                        debug!(addr = ?local.addr, "advertising address");
                        peer.push_address(local);
                    }
                }
            }

            // Get recent addresses.
            if peer.flags.one_shot || self.addr_book.len() < 1000 {
                self.out.send(peer.id, Message::GetAddr);
                peer.set_awaiting_addr(true);
            }
            self.addr_book.mark_good(&peer.addr);
        }

        let offset = version.time - self.validator.adjusted_time();
        peer.set_time_offset(offset);

        info!(
            peer = %peer.id,
            addr = %peer.addr_name,
            subversion = %subversion,
            version = version.version,
            blocks = version.start_height,
            "receive version message"
        );

        // Feeler connections exist only to verify if an address is online.
        if peer.flags.feeler {
            peer.request_disconnect();
        }
        Ok(())
    }

    fn handle_verack(&self, peer: &Peer) -> SyncResult<()> {
        if !peer.flags.inbound {
            // Mark this node as currently connected, so we update its
            // timestamp later.
            let mut state = self.lock_state();
            if let Some(peer_state) = state.peer_mut(peer.id) {
                peer_state.currently_connected = true;
            }
        }
        if peer.version() >= SENDHEADERS_VERSION {
            // Tell our peer we prefer headers announcements over invs.
            self.out.send(peer.id, Message::SendHeaders);
        }
        peer.set_successfully_connected();
        Ok(())
    }

    // --- addresses ---

    fn handle_addr(&self, peer: &Peer, addrs: Vec<NetAddress>, now_us: i64) -> SyncResult<()> {
        if self.addr_book.len() > 1000 {
            return Ok(());
        }
        if addrs.len() > MAX_ADDR_SZ {
            self.lock_state()
                .misbehaving(peer.id, 20, "oversized-addr", self.config.banscore);
            return Err(SyncError::OversizedPayload {
                command: "addr",
                size: addrs.len(),
                max: MAX_ADDR_SZ,
            });
        }

        let now_s = self.validator.adjusted_time();
        let since = now_s - 10 * 60;
        let count = addrs.len();
        let mut good = Vec::new();
        for mut addr in addrs {
            if !addr.services.includes(NODE_NETWORK) {
                continue;
            }
            if addr.time <= 100_000_000 || addr.time > now_s + 10 * 60 {
                addr.time = now_s - 5 * 24 * 60 * 60;
            }
            peer.add_known_address(&addr);
            let reachable = self.addr_book.is_reachable(&addr);
            if addr.time > since && !peer.awaiting_addr() && count <= 10 && addr.is_routable() {
                // Relay to a limited number of other nodes.
                self.relay_address(&addr, reachable, now_us / 1_000_000);
            }
            // Do not store addresses outside our network.
            if reachable {
                good.push(addr);
            }
        }
        self.addr_book.add(good, &peer.addr);
        if count < MAX_ADDR_SZ {
            peer.set_awaiting_addr(false);
        }
        if peer.flags.one_shot {
            peer.request_disconnect();
        }
        Ok(())
    }

    fn handle_getaddr(&self, peer: &Peer) -> SyncResult<()> {
        // Only inbound connections are answered, so a fingerprinting
        // attacker cannot seed fake addresses and read them back.
        if !peer.flags.inbound {
            debug!(peer = %peer.id, "ignoring getaddr from outbound connection");
            return Ok(());
        }
        // One response per connection, to discourage addr stamping.
        if peer.sent_addr() {
            debug!(peer = %peer.id, "ignoring repeated getaddr");
            return Ok(());
        }
        peer.mark_sent_addr();

        peer.addrs.lock().to_send.clear();
        for addr in self.addr_book.select_for_getaddr() {
            peer.push_address(addr);
        }
        Ok(())
    }

    // --- inventory ---

    fn handle_inv(&self, peer: &Peer, invs: Vec<Inv>, now_us: i64) -> SyncResult<()> {
        if invs.len() > MAX_INV_SZ {
            self.lock_state()
                .misbehaving(peer.id, 20, "oversized-inv", self.config.banscore);
            return Err(SyncError::OversizedPayload {
                command: "inv",
                size: invs.len(),
                max: MAX_INV_SZ,
            });
        }

        let mut blocks_only = self.config.blocks_only;
        // Whitelisted peers may relay in blocks-only mode when configured so.
        if peer.flags.whitelisted && self.config.whitelist_relay {
            blocks_only = false;
        }

        let mut state = self.lock_state();
        let mut to_fetch = Vec::new();

        for inv in invs {
            if self.interrupted() {
                return Ok(());
            }
            let have = self.already_have(&mut state, &inv);
            trace!(peer = %peer.id, %inv, have, "got inv");

            match inv.kind {
                InvKind::Block => {
                    state.update_block_availability(peer.id, inv.hash);
                    if !have && !state.in_flight.contains_key(&inv.hash) {
                        // Headers-first: ask for the headers leading to this
                        // announcement; the headers response drives the
                        // actual block requests.
                        let locator = state.chain.locator();
                        self.out.send(
                            peer.id,
                            Message::GetHeaders {
                                locator,
                                stop: inv.hash,
                            },
                        );
                        let best_height = state.chain.get(state.chain.best_header()).height;
                        debug!(peer = %peer.id, height = best_height, block = %inv.hash, "getheaders for inv");

                        let in_flight_here = state
                            .peer(peer.id)
                            .map(|s| s.blocks_in_flight.len())
                            .unwrap_or(0);
                        if state
                            .can_direct_fetch(&self.config.consensus, self.validator.adjusted_time())
                            && in_flight_here < MAX_BLOCKS_IN_TRANSIT_PER_PEER
                        {
                            // The getdata goes out below, under the same lock.
                            to_fetch.push(inv);
                            state.mark_block_in_flight(peer.id, inv.hash, None, now_us);
                        }
                    }
                }
                InvKind::Tx | InvKind::ServiceTx => {
                    peer.add_known_inventory(inv);
                    if blocks_only {
                        info!(peer = %peer.id, %inv, "transaction inv in violation of protocol");
                    } else if !have && !self.validator.is_initial_block_download() {
                        let request_time = Peer::ask_retry_time(
                            state.already_asked.get(&inv.hash).copied(),
                            now_us,
                        );
                        state.already_asked.insert(inv.hash, request_time);
                        peer.ask_for(inv, request_time);
                    }
                }
                InvKind::FilteredBlock => {
                    trace!(peer = %peer.id, %inv, "ignoring filtered-block inv");
                }
            }
        }

        if !to_fetch.is_empty() {
            self.out.send(peer.id, Message::GetData(to_fetch));
        }
        Ok(())
    }

    fn handle_getdata(&self, peer: &Peer, invs: Vec<Inv>, now_us: i64) -> SyncResult<()> {
        if invs.len() > MAX_INV_SZ {
            self.lock_state()
                .misbehaving(peer.id, 20, "too-many-inv", self.config.banscore);
            return Err(SyncError::OversizedPayload {
                command: "getdata",
                size: invs.len(),
                max: MAX_INV_SZ,
            });
        }
        if let Some(first) = invs.first() {
            debug!(peer = %peer.id, count = invs.len(), first = %first, "received getdata");
        }
        peer.getdata_queue.lock().extend(invs);
        self.process_getdata(peer, now_us);
        Ok(())
    }

    // --- chain requests ---

    fn handle_getblocks(&self, peer: &Peer, locator: Locator, stop: Hash256) -> SyncResult<()> {
        let state = self.lock_state();

        // Find the last block the caller has in the main chain, and send
        // inventory from its successor.
        let fork = state.chain.find_fork(&locator);
        let mut cursor = state.chain.next_in_active(fork);
        let mut limit = GETBLOCKS_LIMIT;
        debug!(
            peer = %peer.id,
            from = state.chain.get(fork).height,
            limit,
            "getblocks"
        );
        while let Some(id) = cursor {
            let entry = state.chain.get(id);
            if entry.hash == stop {
                debug!(height = entry.height, hash = %entry.hash, "getblocks stopping");
                break;
            }
            peer.push_inventory(Inv::block(entry.hash));
            limit -= 1;
            if limit == 0 {
                // When this block is requested, an inv will follow so the
                // peer can getblocks the next batch.
                debug!(height = entry.height, hash = %entry.hash, "getblocks stopping at limit");
                *peer.hash_continue.lock() = Some(entry.hash);
                break;
            }
            cursor = state.chain.next_in_active(id);
        }
        Ok(())
    }

    fn handle_getheaders(&self, peer: &Peer, locator: Locator, stop: Hash256) -> SyncResult<()> {
        if self.validator.is_initial_block_download() && !peer.flags.whitelisted {
            debug!(peer = %peer.id, "ignoring getheaders during initial block download");
            return Ok(());
        }

        let mut state = self.lock_state();
        let mut cursor = if locator.is_empty() {
            // A null locator asks for the stop block itself.
            match state.chain.lookup(&stop) {
                Some(id) => Some(id),
                None => return Ok(()),
            }
        } else {
            let fork = state.chain.find_fork(&locator);
            state.chain.next_in_active(fork)
        };

        let mut headers = Vec::new();
        let mut last_sent = None;
        while let Some(id) = cursor {
            let entry = state.chain.get(id);
            let prev_hash = entry
                .prev
                .map(|p| state.chain.get(p).hash)
                .unwrap_or(Hash256::ZERO);
            headers.push(BlockHeader::new(entry.hash, prev_hash, entry.time));
            last_sent = Some(id);
            if headers.len() >= MAX_HEADERS_RESULTS || entry.hash == stop {
                break;
            }
            cursor = state.chain.next_in_active(id);
        }

        // Reset (not max) the best-sent marker: we may have fast-announced a
        // block this response does not include, and resetting guarantees we
        // re-announce it through the headers path.
        let best_sent = last_sent.unwrap_or_else(|| state.chain.tip());
        if let Some(peer_state) = state.peer_mut(peer.id) {
            peer_state.best_header_sent = Some(best_sent);
        }
        self.out.send(peer.id, Message::Headers(headers));
        Ok(())
    }

    fn handle_headers(&self, peer: &Peer, headers: Vec<BlockHeader>, now_us: i64) -> SyncResult<()> {
        if headers.len() > MAX_HEADERS_RESULTS {
            self.lock_state()
                .misbehaving(peer.id, 20, "too-many-headers", self.config.banscore);
            return Err(SyncError::OversizedPayload {
                command: "headers",
                size: headers.len(),
                max: MAX_HEADERS_RESULTS,
            });
        }
        if headers.is_empty() {
            // Nothing interesting. Stop asking this peer for more headers.
            return Ok(());
        }

        let mut state = self.lock_state();

        let mut last: Option<BlockId> = None;
        for header in &headers {
            if let Some(prev) = last {
                if header.prev != state.chain.get(prev).hash {
                    state.misbehaving(peer.id, 20, "disconnected-header", self.config.banscore);
                    return Err(SyncError::DisconnectedHeaders);
                }
            }
            last = Some(self.accept_header(&mut state, peer, header)?);
        }
        let last = last.expect("non-empty headers");
        let last_hash = state.chain.get(last).hash;
        state.update_block_availability(peer.id, last_hash);

        if headers.len() == MAX_HEADERS_RESULTS {
            // The message was full; the peer may have more headers for us.
            debug!(
                peer = %peer.id,
                height = state.chain.get(last).height,
                "more getheaders"
            );
            let locator = state.chain.locator_from(last);
            self.out.send(
                peer.id,
                Message::GetHeaders {
                    locator,
                    stop: Hash256::ZERO,
                },
            );
        }

        // If this chain ends at least at our tip, fetch toward it directly.
        let can_fetch = state.can_direct_fetch(&self.config.consensus, self.validator.adjusted_time());
        if can_fetch
            && !state.chain.get(last).failed
            && state.chain.tip_entry().work <= state.chain.get(last).work
        {
            let mut to_fetch = Vec::new();
            let mut walk = last;
            let mut on_chain = false;
            loop {
                if state.chain.contains(walk) {
                    on_chain = true;
                    break;
                }
                if to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                    break;
                }
                let entry = state.chain.get(walk);
                if !entry.have_data && !state.in_flight.contains_key(&entry.hash) {
                    to_fetch.push(walk);
                }
                match entry.prev {
                    Some(prev) => walk = prev,
                    None => break,
                }
            }

            if !on_chain {
                // A very large reorg at a time we think we are caught up;
                // rely on the parallel download path instead.
                debug!(
                    peer = %peer.id,
                    toward = %last_hash,
                    "large reorg, not direct-fetching"
                );
            } else {
                let mut getdata = Vec::new();
                for id in to_fetch.into_iter().rev() {
                    let in_flight_here = state
                        .peer(peer.id)
                        .map(|s| s.blocks_in_flight.len())
                        .unwrap_or(0);
                    if in_flight_here >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                        break;
                    }
                    let hash = state.chain.get(id).hash;
                    getdata.push(Inv::block(hash));
                    state.mark_block_in_flight(peer.id, hash, Some(id), now_us);
                    debug!(peer = %peer.id, block = %hash, "requesting block");
                }
                if getdata.len() > 1 {
                    debug!(
                        peer = %peer.id,
                        count = getdata.len(),
                        toward = %last_hash,
                        "downloading blocks via headers direct fetch"
                    );
                }
                if !getdata.is_empty() {
                    self.out.send(peer.id, Message::GetData(getdata));
                }
            }
        }
        Ok(())
    }

    fn accept_header(
        &self,
        state: &mut CoreState,
        peer: &Peer,
        header: &BlockHeader,
    ) -> SyncResult<BlockId> {
        if let Some(existing) = state.chain.lookup(&header.hash) {
            return Ok(existing);
        }
        let Some(prev) = state.chain.lookup(&header.prev) else {
            state.misbehaving(peer.id, 10, "prev-blk-not-found", self.config.banscore);
            return Err(SyncError::InvalidHeader("unknown parent".into()));
        };
        if state.chain.get(prev).failed {
            state.misbehaving(peer.id, 100, "bad-prevblk", self.config.banscore);
            return Err(SyncError::InvalidHeader("invalid parent".into()));
        }
        match self.validator.check_header(header) {
            Ok(work) => Ok(state.chain.insert_header(*header, prev, work)),
            Err(failure) => {
                if failure.dos > 0 {
                    state.misbehaving(peer.id, failure.dos, &failure.reason, self.config.banscore);
                }
                Err(SyncError::InvalidHeader(failure.reason))
            }
        }
    }

    // --- transactions ---

    fn handle_tx(&self, peer: &Peer, tx: Transaction, now_us: i64) -> SyncResult<()> {
        // Blocks-only mode drops loose transactions outright unless the
        // peer is whitelisted for relay.
        if self.config.blocks_only && (!peer.flags.whitelisted || !self.config.whitelist_relay) {
            info!(peer = %peer.id, "transaction sent in violation of protocol");
            return Ok(());
        }

        let inv = Inv::tx(tx.txid);
        peer.add_known_inventory(inv);

        let mut state = self.lock_state();
        peer.cancel_ask(&tx.txid);
        state.already_asked.remove(&tx.txid);

        let have = self.already_have(&mut state, &inv);
        let verdict = if have {
            None
        } else {
            Some(self.validator.accept_transaction(&tx))
        };

        match verdict {
            Some(TxVerdict::Accepted) => {
                self.relay_transaction(&tx);
                peer.set_last_tx_time(now_us / 1_000_000);
                debug!(peer = %peer.id, tx = %tx.txid, "accepted to memory pool");
                self.resolve_orphans(&mut state, tx.txid);
                Ok(())
            }
            Some(TxVerdict::MissingInputs) => {
                // The parents may themselves have been rejected already.
                let rejected_parents = tx
                    .inputs
                    .iter()
                    .any(|input| state.recent_rejects.contains(input.hash.as_ref()));
                if rejected_parents {
                    debug!(tx = %tx.txid, "not keeping orphan with rejected parents");
                    // Keep rejecting the child too, instead of re-requesting
                    // it from every peer.
                    state.recent_rejects.insert(tx.txid.as_ref());
                } else {
                    for input in &tx.inputs {
                        let parent = Inv::tx(input.hash);
                        peer.add_known_inventory(parent);
                        if !self.already_have(&mut state, &parent) {
                            let request_time = Peer::ask_retry_time(
                                state.already_asked.get(&input.hash).copied(),
                                now_us,
                            );
                            state.already_asked.insert(input.hash, request_time);
                            peer.ask_for(parent, request_time);
                        }
                    }
                    state.orphans.add(tx, peer.id);

                    // Keep the orphan pool from growing unbounded.
                    let evicted = state.orphans.evict_to(self.config.max_orphan_tx);
                    if evicted > 0 {
                        debug!(evicted, "orphan pool overflow");
                    }
                }
                Ok(())
            }
            other => {
                // Already had it, or validation failed outright.
                let failure = match other {
                    Some(TxVerdict::Invalid(failure)) => Some(failure),
                    _ => None,
                };
                let malleated = failure.as_ref().map(|f| f.malleated).unwrap_or(false);
                if !malleated {
                    // Malleated payloads must not poison the filter for the
                    // honest encoding of the same transaction.
                    state.recent_rejects.insert(tx.txid.as_ref());
                }

                if peer.flags.whitelisted && self.config.whitelist_force_relay {
                    let dos = failure.as_ref().map(|f| f.dos).unwrap_or(0);
                    if dos == 0 {
                        // A gateway node relays for the peers hidden behind
                        // it, even when the mempool refused the transaction.
                        debug!(peer = %peer.id, tx = %tx.txid, "force relaying tx from whitelisted peer");
                        self.relay_transaction(&tx);
                    } else {
                        debug!(peer = %peer.id, tx = %tx.txid, "not relaying invalid transaction");
                    }
                }

                if let Some(failure) = failure {
                    info!(
                        peer = %peer.id,
                        tx = %tx.txid,
                        reason = %failure.reason,
                        "transaction was not accepted"
                    );
                    if let Some(code) = failure.code {
                        // Internal codes never cross the wire.
                        self.out.send(
                            peer.id,
                            Message::Reject(Reject::new("tx", code, &failure.reason, Some(tx.txid))),
                        );
                    }
                    if failure.dos > 0 {
                        state.misbehaving(peer.id, failure.dos, &failure.reason, self.config.banscore);
                    }
                }
                Ok(())
            }
        }
    }

    /// Re-check orphans whose missing parent just arrived, cascading through
    /// grandchildren as each orphan is accepted.
    fn resolve_orphans(&self, state: &mut CoreState, accepted: Hash256) {
        let mut work: VecDeque<Hash256> = VecDeque::new();
        work.push_back(accepted);
        let mut erase_queue = Vec::new();
        // A dummy-state accept keeps one peer's invalid orphan from scoring
        // everyone who relayed the legitimate parent.
        let mut misbehaving_peers: HashSet<PeerId> = HashSet::new();

        while let Some(parent) = work.pop_front() {
            for orphan_hash in state.orphans.children_of(&parent) {
                let (orphan_tx, from_peer) = {
                    let Some(entry) = state.orphans.get(&orphan_hash) else {
                        continue;
                    };
                    (entry.tx.clone(), entry.from_peer)
                };
                if misbehaving_peers.contains(&from_peer) {
                    continue;
                }
                match self.validator.accept_transaction(&orphan_tx) {
                    TxVerdict::Accepted => {
                        debug!(orphan = %orphan_hash, "accepted orphan tx");
                        self.relay_transaction(&orphan_tx);
                        work.push_back(orphan_hash);
                        erase_queue.push(orphan_hash);
                    }
                    TxVerdict::MissingInputs => {
                        // Still orphaned on another parent; keep it parked.
                    }
                    TxVerdict::Invalid(failure) => {
                        if failure.dos > 0 {
                            // Punish the peer that gave us the invalid orphan.
                            state.misbehaving(
                                from_peer,
                                failure.dos,
                                "invalid-orphan-tx",
                                self.config.banscore,
                            );
                            misbehaving_peers.insert(from_peer);
                            debug!(orphan = %orphan_hash, "invalid orphan tx");
                        }
                        debug!(orphan = %orphan_hash, "removed orphan tx");
                        erase_queue.push(orphan_hash);
                        if !failure.malleated {
                            state.recent_rejects.insert(orphan_hash.as_ref());
                        }
                    }
                }
            }
        }
        for hash in erase_queue {
            state.orphans.erase(&hash);
        }
    }

    fn handle_service_tx(&self, peer: &Peer, stx: ServiceTransaction, now_us: i64) -> SyncResult<()> {
        if stx.payment_hash.is_zero() {
            return Err(SyncError::ServiceTxWithoutPayment(stx.hash));
        }
        self.service_pool.add(&stx);

        let Some(payment) = self.validator.get_transaction(&stx.payment_hash) else {
            // We do not have the payment transaction yet; stash the hash and
            // retry once it confirms.
            let mut pending = self.pending_service_tx.lock();
            pending.entry(stx.hash).or_insert(now_us);
            return Ok(());
        };

        match self.validator.accept_service_transaction(&stx, &payment) {
            Ok(()) => {
                self.relay_service_transaction(&stx);
                Ok(())
            }
            Err(failure) => {
                {
                    let mut pending = self.pending_service_tx.lock();
                    pending.entry(stx.hash).or_insert(now_us);
                }
                if failure.dos > 0 || failure.code.is_some() {
                    info!(
                        peer = %peer.id,
                        stx = %stx.hash,
                        reason = %failure.reason,
                        "service transaction was not accepted"
                    );
                    if let Some(code) = failure.code {
                        self.out.send(
                            peer.id,
                            Message::Reject(Reject::new("stx", code, &failure.reason, Some(stx.hash))),
                        );
                    }
                    if failure.dos > 0 {
                        self.lock_state().misbehaving(
                            peer.id,
                            failure.dos,
                            &failure.reason,
                            self.config.banscore,
                        );
                    }
                }
                Ok(())
            }
        }
    }

    // --- blocks ---

    fn handle_block(&self, peer: &Peer, block: Block, now_us: i64) -> SyncResult<()> {
        let hash = block.hash();
        debug!(peer = %peer.id, block = %hash, "received block");

        // Process blocks from whitelisted peers even when not requested,
        // unless we are still syncing with the network.
        let mut force = peer.flags.whitelisted && !self.validator.is_initial_block_download();
        {
            let mut state = self.lock_state();
            // Always process blocks we explicitly requested; we may need
            // them even if they are no candidate for a new best tip.
            force |= state.mark_block_received(&hash, now_us);
            state.block_source.insert(hash, (peer.id, true));
        }

        let verdict = self.validator.submit_block(&block, force);

        let mut state = self.lock_state();
        match verdict {
            BlockVerdict::Accepted { work } => {
                let id = match state.chain.lookup(&hash) {
                    Some(id) => Some(id),
                    None => state
                        .chain
                        .lookup(&block.header.prev)
                        .map(|prev| state.chain.insert_header(block.header, prev, work)),
                };
                if let Some(id) = id {
                    state.chain.mark_block_data(id);
                }
                state.block_source.remove(&hash);
            }
            BlockVerdict::Invalid(failure) => {
                self.handle_block_failure(&mut state, hash, &failure);
            }
        }
        Ok(())
    }

    // --- mempool / ping / filters ---

    fn handle_mempool(&self, peer: &Peer) -> SyncResult<()> {
        let hashes = self.mempool.tx_hashes();
        let mut invs = Vec::new();
        for hash in hashes {
            {
                let filter = peer.filter.lock();
                if let Some(filter) = filter.as_ref() {
                    // Another thread may have removed the tx since the
                    // snapshot was taken.
                    let Some(tx) = self.mempool.get(&hash) else {
                        continue;
                    };
                    if !filter.matches_transaction(&tx) {
                        continue;
                    }
                }
            }
            invs.push(Inv::tx(hash));
            if invs.len() == MAX_INV_SZ {
                self.out.send(peer.id, Message::Inv(std::mem::take(&mut invs)));
            }
        }
        if !invs.is_empty() {
            self.out.send(peer.id, Message::Inv(invs));
        }
        Ok(())
    }

    fn handle_pong(&self, peer: &Peer, nonce: u64, now_us: i64) -> SyncResult<()> {
        let outstanding = peer.ping_nonce_sent();
        let problem = if outstanding == 0 {
            Some("unsolicited pong without ping")
        } else if nonce == outstanding {
            peer.finish_ping(now_us);
            None
        } else if nonce == 0 {
            // Most likely a bug in another implementation; cancel the probe.
            peer.abort_ping();
            Some("nonce zero")
        } else {
            // Nonce mismatches are normal when pings overlap.
            Some("nonce mismatch")
        };
        if let Some(problem) = problem {
            debug!(
                peer = %peer.id,
                problem,
                expected = outstanding,
                received = nonce,
                "pong"
            );
        }
        Ok(())
    }

    fn handle_filterload(&self, peer: &Peer, filter: FilterLoad) -> SyncResult<()> {
        match PeerFilter::load(filter.data, filter.hash_funcs, filter.tweak) {
            Ok(loaded) => {
                *peer.filter.lock() = Some(loaded);
            }
            Err(_) => {
                // There is no excuse for sending a too-large filter.
                self.lock_state().misbehaving(
                    peer.id,
                    100,
                    "oversized-bloom-filter",
                    self.config.banscore,
                );
            }
        }
        peer.set_relay_txes(true);
        Ok(())
    }

    fn handle_filteradd(&self, peer: &Peer, data: Vec<u8>) -> SyncResult<()> {
        let failed = {
            let mut filter = peer.filter.lock();
            match filter.as_mut() {
                Some(filter) => filter.insert(&data).is_err(),
                None => true,
            }
        };
        if failed {
            self.lock_state()
                .misbehaving(peer.id, 100, "invalid-filteradd", self.config.banscore);
        }
        Ok(())
    }
}
