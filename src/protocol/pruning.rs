//! Blockchain pruning stripes
//!
//! A pruning seed packs `log_stripes` (bits 7..10) and `stripe - 1`
//! (bits 0..7). Seed 0 means the peer keeps every block. Outside the tip
//! window, heights are grouped into runs of `CRYPTONOTE_PRUNING_STRIPE_SIZE`
//! and a pruned peer only keeps the runs of its own stripe.

use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

pub const CRYPTONOTE_PRUNING_STRIPE_SIZE: u64 = 4096;
pub const CRYPTONOTE_PRUNING_LOG_STRIPES: u32 = 3;
pub const CRYPTONOTE_PRUNING_TIP_BLOCKS: u64 = 5500;

const PRUNING_SEED_LOG_STRIPES_SHIFT: u32 = 7;
const PRUNING_SEED_LOG_STRIPES_MASK: u32 = 0x7;
const PRUNING_SEED_STRIPE_SHIFT: u32 = 0;
const PRUNING_SEED_STRIPE_MASK: u32 = 0x7f;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PruningError {
    #[error("log_stripes {0} out of range")]
    LogStripesOutOfRange(u32),
    #[error("stripe {stripe} out of range for log_stripes {log_stripes}")]
    StripeOutOfRange { stripe: u32, log_stripes: u32 },
}

pub fn make_pruning_seed(stripe: u32, log_stripes: u32) -> Result<u32, PruningError> {
    if log_stripes > PRUNING_SEED_LOG_STRIPES_MASK {
        return Err(PruningError::LogStripesOutOfRange(log_stripes));
    }
    if stripe == 0 || stripe > (1u32 << log_stripes) {
        return Err(PruningError::StripeOutOfRange { stripe, log_stripes });
    }
    Ok((log_stripes << PRUNING_SEED_LOG_STRIPES_SHIFT) | ((stripe - 1) << PRUNING_SEED_STRIPE_SHIFT))
}

/// Stripe of a seed, 0 for an unpruned node
pub fn get_pruning_stripe(pruning_seed: u32) -> u32 {
    if pruning_seed == 0 {
        return 0;
    }
    1 + ((pruning_seed >> PRUNING_SEED_STRIPE_SHIFT) & PRUNING_SEED_STRIPE_MASK)
}

pub fn get_pruning_log_stripes(pruning_seed: u32) -> u32 {
    (pruning_seed >> PRUNING_SEED_LOG_STRIPES_SHIFT) & PRUNING_SEED_LOG_STRIPES_MASK
}

/// Stripe a block belongs to, 0 inside the tip window
pub fn get_pruning_stripe_for_height(block_height: u64, blockchain_height: u64, log_stripes: u32) -> u32 {
    if block_height.saturating_add(CRYPTONOTE_PRUNING_TIP_BLOCKS) >= blockchain_height {
        return 0;
    }
    let mask = (1u64 << log_stripes) - 1;
    (((block_height / CRYPTONOTE_PRUNING_STRIPE_SIZE) & mask) + 1) as u32
}

/// Seed of the node that keeps `block_height`, 0 inside the tip window
pub fn get_pruning_seed_for_height(
    block_height: u64,
    blockchain_height: u64,
    log_stripes: u32,
) -> Result<u32, PruningError> {
    match get_pruning_stripe_for_height(block_height, blockchain_height, log_stripes) {
        0 => Ok(0),
        stripe => make_pruning_seed(stripe, log_stripes),
    }
}

pub fn has_unpruned_block(block_height: u64, blockchain_height: u64, pruning_seed: u32) -> bool {
    let stripe = get_pruning_stripe(pruning_seed);
    if stripe == 0 {
        return true;
    }
    let log_stripes = get_pruning_log_stripes(pruning_seed);
    let block_stripe = get_pruning_stripe_for_height(block_height, blockchain_height, log_stripes);
    block_stripe == 0 || block_stripe == stripe
}

fn effective_log_stripes(pruning_seed: u32) -> u32 {
    match get_pruning_log_stripes(pruning_seed) {
        0 => CRYPTONOTE_PRUNING_LOG_STRIPES,
        n => n,
    }
}

/// First height at or after `block_height` that a node with this seed keeps
pub fn get_next_unpruned_block_height(block_height: u64, blockchain_height: u64, pruning_seed: u32) -> u64 {
    let stripe = get_pruning_stripe(pruning_seed) as u64;
    if stripe == 0 {
        return block_height;
    }
    if block_height.saturating_add(CRYPTONOTE_PRUNING_TIP_BLOCKS) >= blockchain_height {
        return block_height;
    }
    let log_stripes = effective_log_stripes(pruning_seed);
    let mask = (1u64 << log_stripes) - 1;
    let block_stripe = ((block_height / CRYPTONOTE_PRUNING_STRIPE_SIZE) & mask) + 1;
    if block_stripe == stripe {
        return block_height;
    }
    let cycles = (block_height / CRYPTONOTE_PRUNING_STRIPE_SIZE) >> log_stripes;
    let cycle_start = cycles + if stripe > block_stripe { 0 } else { 1 };
    let h = cycle_start * (CRYPTONOTE_PRUNING_STRIPE_SIZE << log_stripes)
        + (stripe - 1) * CRYPTONOTE_PRUNING_STRIPE_SIZE;
    if h + CRYPTONOTE_PRUNING_TIP_BLOCKS > blockchain_height {
        return blockchain_height.saturating_sub(CRYPTONOTE_PRUNING_TIP_BLOCKS);
    }
    h
}

/// First height at or after `block_height` that a node with this seed does
/// not keep; `blockchain_height` if there is none
pub fn get_next_pruned_block_height(block_height: u64, blockchain_height: u64, pruning_seed: u32) -> u64 {
    let stripe = get_pruning_stripe(pruning_seed) as u64;
    if stripe == 0 {
        return blockchain_height;
    }
    if block_height.saturating_add(CRYPTONOTE_PRUNING_TIP_BLOCKS) >= blockchain_height {
        return blockchain_height;
    }
    let log_stripes = effective_log_stripes(pruning_seed);
    let mask = (1u64 << log_stripes) - 1;
    let block_stripe = ((block_height / CRYPTONOTE_PRUNING_STRIPE_SIZE) & mask) + 1;
    if block_stripe != stripe {
        return block_height;
    }
    let next_stripe = 1 + (block_stripe & mask) as u32;
    match make_pruning_seed(next_stripe, log_stripes) {
        Ok(seed) => get_next_unpruned_block_height(block_height, blockchain_height, seed),
        Err(_) => blockchain_height,
    }
}

/// Seeds a peer may advertise: 0, or one of ours with the standard stripe count
pub fn is_valid_peer_seed(pruning_seed: u32) -> bool {
    pruning_seed == 0
        || (get_pruning_log_stripes(pruning_seed) == CRYPTONOTE_PRUNING_LOG_STRIPES
            && get_pruning_stripe(pruning_seed) <= (1 << CRYPTONOTE_PRUNING_LOG_STRIPES))
}

pub fn get_random_stripe() -> u32 {
    1 + rand::random::<u32>() % (1 << CRYPTONOTE_PRUNING_LOG_STRIPES)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS: u64 = CRYPTONOTE_PRUNING_STRIPE_SIZE;
    const NS: u64 = 1 << CRYPTONOTE_PRUNING_LOG_STRIPES;
    const TB: u64 = NS * SS;
    const H: u64 = 10_000_000;

    fn seed(stripe: u32) -> u32 {
        make_pruning_seed(stripe, CRYPTONOTE_PRUNING_LOG_STRIPES).unwrap()
    }

    #[test]
    fn test_seed_parts() {
        assert_eq!(get_pruning_stripe(make_pruning_seed(3, 2).unwrap()), 3);
        assert_eq!(get_pruning_stripe(make_pruning_seed(1, 2).unwrap()), 1);
        assert_eq!(get_pruning_stripe(make_pruning_seed(7, 7).unwrap()), 7);
        assert_eq!(get_pruning_log_stripes(make_pruning_seed(1, 0).unwrap()), 0);
        assert_eq!(get_pruning_log_stripes(make_pruning_seed(7, 7).unwrap()), 7);

        for log_stripes in 1..=PRUNING_SEED_LOG_STRIPES_MASK {
            for stripe in 1..=(1u32 << log_stripes).min(PRUNING_SEED_STRIPE_MASK + 1) {
                let seed = make_pruning_seed(stripe, log_stripes).unwrap();
                assert_ne!(seed, 0);
                assert_eq!(get_pruning_log_stripes(seed), log_stripes);
                assert_eq!(get_pruning_stripe(seed), stripe);
            }
        }
    }

    #[test]
    fn test_seed_out_of_range() {
        assert!(make_pruning_seed(5, 2).is_err());
        assert!(make_pruning_seed(0, 2).is_err());
        assert!(make_pruning_seed(1, 8).is_err());
    }

    #[test]
    fn test_tip_is_never_pruned() {
        let h = 1_000_000;
        for block in (h - CRYPTONOTE_PRUNING_TIP_BLOCKS)..h {
            assert_eq!(get_pruning_stripe_for_height(block, h, CRYPTONOTE_PRUNING_LOG_STRIPES), 0);
            assert!(has_unpruned_block(block, h, seed(2)));
        }
    }

    #[test]
    fn test_stripe_for_height() {
        let lg = CRYPTONOTE_PRUNING_LOG_STRIPES;
        for cycle in [0u64, 5, 100] {
            let o = cycle * TB;
            assert_eq!(get_pruning_stripe_for_height(o, H, lg), 1);
            assert_eq!(get_pruning_stripe_for_height(o + SS - 1, H, lg), 1);
            assert_eq!(get_pruning_stripe_for_height(o + SS, H, lg), 2);
            assert_eq!(get_pruning_stripe_for_height(o + SS * 2, H, lg), 3);
            assert_eq!(get_pruning_stripe_for_height(o + SS * NS - 1, H, lg), NS as u32);
            assert_eq!(get_pruning_stripe_for_height(o + SS * NS, H, lg), 1);
        }
    }

    #[test]
    fn test_only_own_stripe_has_block() {
        let h = 3 * TB + 7;
        let owner = get_pruning_seed_for_height(h, H, CRYPTONOTE_PRUNING_LOG_STRIPES).unwrap();
        for stripe in 1..=NS as u32 {
            let other = seed(stripe);
            assert_eq!(has_unpruned_block(h, H, other), other == owner);
        }
        assert!(has_unpruned_block(h, H, 0));
    }

    #[test]
    fn test_next_unpruned() {
        for h in [0, 1, SS, TB + 17] {
            assert_eq!(get_next_unpruned_block_height(h, H, 0), h);
        }
        let (s1, s2, s3, sns) = (seed(1), seed(2), seed(3), seed(NS as u32));

        assert_eq!(get_next_unpruned_block_height(0, H, s1), 0);
        assert_eq!(get_next_unpruned_block_height(SS - 1, H, s1), SS - 1);
        assert_eq!(get_next_unpruned_block_height(SS, H, s1), TB);
        assert_eq!(get_next_unpruned_block_height(TB - 1, H, s1), TB);

        assert_eq!(get_next_unpruned_block_height(0, H, s2), SS);
        assert_eq!(get_next_unpruned_block_height(2 * SS - 1, H, s2), 2 * SS - 1);
        assert_eq!(get_next_unpruned_block_height(2 * SS, H, s2), TB + SS);
        assert_eq!(get_next_unpruned_block_height(TB + 2 * SS, H, s2), TB * 2 + SS);

        assert_eq!(get_next_unpruned_block_height(0, H, s3), SS * 2);
        assert_eq!(get_next_unpruned_block_height(3 * SS, H, s3), TB + SS * 2);

        assert_eq!(get_next_unpruned_block_height(SS, H, sns), (NS - 1) * SS);
        assert_eq!(get_next_unpruned_block_height(NS * SS, H, sns), TB + (NS - 1) * SS);
    }

    #[test]
    fn test_next_unpruned_near_tip() {
        // the next run of the stripe starts inside the tip window
        let chain = TB + 100;
        assert_eq!(
            get_next_unpruned_block_height(SS, chain, seed(1)),
            chain - CRYPTONOTE_PRUNING_TIP_BLOCKS
        );
    }

    #[test]
    fn test_next_pruned() {
        for h in [0, 1, SS, TB] {
            assert_eq!(get_next_pruned_block_height(h, H, 0), H);
        }
        let (s1, s2, sns) = (seed(1), seed(2), seed(NS as u32));

        assert_eq!(get_next_pruned_block_height(1, H, s1), SS);
        assert_eq!(get_next_pruned_block_height(SS - 1, H, s1), SS);
        assert_eq!(get_next_pruned_block_height(SS, H, s1), SS);
        assert_eq!(get_next_pruned_block_height(TB - 1, H, s1), TB - 1);
        assert_eq!(get_next_pruned_block_height(TB, H, s1), TB + SS);

        assert_eq!(get_next_pruned_block_height(1, H, s2), 1);
        assert_eq!(get_next_pruned_block_height(SS, H, s2), 2 * SS);

        assert_eq!(get_next_pruned_block_height(SS, H, sns), SS);
        assert_eq!(get_next_pruned_block_height(TB - 1, H, sns), TB);
    }

    #[test]
    fn test_peer_seed_validation() {
        assert!(is_valid_peer_seed(0));
        assert!(is_valid_peer_seed(seed(8)));
        assert!(!is_valid_peer_seed(make_pruning_seed(1, 2).unwrap()));
        for _ in 0..32 {
            let stripe = get_random_stripe();
            assert!((1..=NS as u32).contains(&stripe));
        }
    }
}
