use std::{cmp::Reverse, collections::HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::PeerKey;

pub const DEFAULT_UNCHOKE_SLOTS: usize = 4;
pub const DEFAULT_OPTIMISTIC_UNCHOKE_TICKS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChokeDecision {
    Choke,
    Unchoke,
}

/// Decides which peers get upload slots.
///
/// Every tick the fastest peers take the regular slots, and every
/// `rotate_every` ticks one more peer picked at random gets the optimistic
/// slot. Only changes against the previous tick produce decisions.
#[derive(Debug)]
pub struct Choker {
    slots: usize,
    rotate_every: u64,
    ticks: u64,
    unchoked: HashSet<PeerKey>,
    optimistic: Option<PeerKey>,
    rng: StdRng,
}

impl Choker {
    pub fn new(slots: usize, rotate_every: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            slots,
            rotate_every: rotate_every.max(1),
            ticks: 0,
            unchoked: Default::default(),
            optimistic: None,
            rng,
        }
    }

    pub fn is_unchoked(&self, key: PeerKey) -> bool {
        self.unchoked.contains(&key)
    }

    pub fn optimistic(&self) -> Option<PeerKey> {
        self.optimistic
    }

    pub fn peer_removed(&mut self, key: PeerKey) {
        self.unchoked.remove(&key);
        if self.optimistic == Some(key) {
            self.optimistic = None;
        }
    }

    /// Run one round over the connected peers and their transfer rate.
    pub fn tick(&mut self, candidates: &[(PeerKey, u32)]) -> Vec<(PeerKey, ChokeDecision)> {
        let rotate = self.ticks % self.rotate_every == 0;
        self.ticks += 1;

        let mut ranked = candidates
            .iter()
            .filter(|(key, _)| rotate || self.optimistic != Some(*key))
            .copied()
            .collect::<Vec<_>>();
        ranked.sort_by_key(|&(key, rate)| (Reverse(rate), key));
        let top = ranked
            .iter()
            .take(self.slots)
            .map(|&(key, _)| key)
            .collect::<HashSet<_>>();

        if rotate {
            let pool = candidates
                .iter()
                .map(|&(key, _)| key)
                .filter(|key| !top.contains(key) && self.optimistic != Some(*key))
                .collect::<Vec<_>>();
            let current = self.optimistic.filter(|key| !top.contains(key));
            self.optimistic = pool.choose(&mut self.rng).copied().or(current);
            if let Some(key) = self.optimistic {
                tracing::debug!(peer = ?key, "optimistic unchoke");
            }
        }

        let mut desired = top;
        desired.extend(self.optimistic);

        let mut decisions = self
            .unchoked
            .difference(&desired)
            .map(|&key| (key, ChokeDecision::Choke))
            .chain(
                desired
                    .difference(&self.unchoked)
                    .map(|&key| (key, ChokeDecision::Unchoke)),
            )
            .collect::<Vec<_>>();
        decisions.sort_by_key(|&(key, _)| key);
        self.unchoked = desired;
        decisions
    }
}

impl Default for Choker {
    fn default() -> Self {
        Self::new(DEFAULT_UNCHOKE_SLOTS, DEFAULT_OPTIMISTIC_UNCHOKE_TICKS, None)
    }
}

#[cfg(test)]
mod test {
    use slotmap::SlotMap;

    use super::*;

    fn keys(n: usize) -> Vec<PeerKey> {
        let mut map = SlotMap::<PeerKey, ()>::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn decision(decisions: &[(PeerKey, ChokeDecision)], key: PeerKey) -> Option<ChokeDecision> {
        decisions
            .iter()
            .find(|(k, _)| *k == key)
            .map(|&(_, decision)| decision)
    }

    #[test]
    fn fastest_peers_are_unchoked() {
        let k = keys(3);
        let mut choker = Choker::new(2, 3, Some(7));
        let decisions = choker.tick(&[(k[0], 10), (k[1], 5), (k[2], 1)]);

        assert_eq!(decision(&decisions, k[0]), Some(ChokeDecision::Unchoke));
        assert_eq!(decision(&decisions, k[1]), Some(ChokeDecision::Unchoke));
        // the slowest peer is only unchoked as the optimistic pick
        assert_eq!(
            choker.is_unchoked(k[2]),
            choker.optimistic() == Some(k[2])
        );
    }

    #[test]
    fn first_tick_picks_an_optimistic_peer() {
        let k = keys(3);
        let mut choker = Choker::new(2, 3, Some(1));
        choker.tick(&[(k[0], 10), (k[1], 5), (k[2], 1)]);
        assert_eq!(choker.optimistic(), Some(k[2]));
        assert!(choker.is_unchoked(k[2]));
    }

    #[test]
    fn unchanged_ranking_emits_nothing() {
        let k = keys(3);
        let mut choker = Choker::new(2, 3, Some(1));
        let candidates = [(k[0], 10), (k[1], 5), (k[2], 1)];
        assert_eq!(choker.tick(&candidates).len(), 3);
        assert!(choker.tick(&candidates).is_empty());
    }

    #[test]
    fn optimistic_peer_is_not_ranked_between_rotations() {
        let k = keys(4);
        let mut choker = Choker::new(2, 3, Some(1));
        choker.tick(&[(k[0], 10), (k[1], 5), (k[2], 1)]);
        assert_eq!(choker.optimistic(), Some(k[2]));

        // k2 is now the fastest but keeps the optimistic slot, k3 takes k1's
        let decisions = choker.tick(&[(k[0], 10), (k[1], 5), (k[2], 100), (k[3], 50)]);
        assert_eq!(
            decisions,
            vec![(k[1], ChokeDecision::Choke), (k[3], ChokeDecision::Unchoke)]
        );
        assert_eq!(choker.optimistic(), Some(k[2]));
    }

    #[test]
    fn rotation_moves_the_optimistic_slot() {
        let k = keys(4);
        let mut choker = Choker::new(1, 3, Some(3));
        let candidates = [(k[0], 10), (k[1], 1), (k[2], 1), (k[3], 1)];
        choker.tick(&candidates);
        let first = choker.optimistic().unwrap();
        assert_ne!(first, k[0]);

        choker.tick(&candidates);
        choker.tick(&candidates);
        assert_eq!(choker.optimistic(), Some(first));

        let decisions = choker.tick(&candidates);
        let second = choker.optimistic().unwrap();
        assert_ne!(second, first);
        assert_ne!(second, k[0]);
        assert_eq!(decision(&decisions, first), Some(ChokeDecision::Choke));
        assert_eq!(decision(&decisions, second), Some(ChokeDecision::Unchoke));
    }

    #[test]
    fn promoted_optimistic_peer_stays_unchoked() {
        let k = keys(3);
        let mut choker = Choker::new(1, 1, Some(5));
        choker.tick(&[(k[0], 10), (k[1], 1)]);
        assert_eq!(choker.optimistic(), Some(k[1]));

        // k1 becomes the fastest on a rotation tick and takes the regular slot
        let decisions = choker.tick(&[(k[0], 10), (k[1], 20), (k[2], 1)]);
        assert!(choker.is_unchoked(k[1]));
        assert_eq!(decision(&decisions, k[1]), None);
        assert_ne!(choker.optimistic(), Some(k[1]));
    }

    #[test]
    fn removed_peers_are_forgotten() {
        let k = keys(2);
        let mut choker = Choker::new(1, 3, Some(1));
        choker.tick(&[(k[0], 10), (k[1], 1)]);
        assert_eq!(choker.optimistic(), Some(k[1]));

        choker.peer_removed(k[1]);
        assert!(choker.optimistic().is_none());
        assert!(!choker.is_unchoked(k[1]));
        assert!(choker.tick(&[(k[0], 10)]).is_empty());
    }
}
