//! Peer sampling for gossip rounds.

use rand::Rng;

/// Pick up to `fanout` gossip targets from `peers`, never including `self_id`.
///
/// When the remaining peers fit within the fanout they are all returned, in
/// order. Otherwise `fanout` peers are drawn uniformly with replacement, so a
/// round may contact the same peer twice.
pub fn sample_peers<R: Rng + ?Sized>(
    peers: &[String],
    self_id: &str,
    fanout: usize,
    rng: &mut R,
) -> Vec<String> {
    let candidates: Vec<&String> = peers.iter().filter(|p| p.as_str() != self_id).collect();

    if candidates.len() <= fanout {
        return candidates.into_iter().cloned().collect();
    }

    (0..fanout)
        .map(|_| candidates[rng.gen_range(0..candidates.len())].clone())
        .collect()
}
