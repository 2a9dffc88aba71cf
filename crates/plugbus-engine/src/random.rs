use rand::rngs::OsRng;
use rand::RngCore;

/// Source of call ids. Ids cross the trust boundary, so production sources
/// must be unpredictable.
pub trait CallIdSource: Send {
    fn next_call_id(&mut self) -> u64;
}

/// Draws call ids from the operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsCallIds;

impl CallIdSource for OsCallIds {
    fn next_call_id(&mut self) -> u64 {
        OsRng.next_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn os_ids_do_not_repeat() {
        let mut ids = OsCallIds;
        let seen: HashSet<u64> = (0..1000).map(|_| ids.next_call_id()).collect();
        assert_eq!(seen.len(), 1000);
    }
}
