//! Session keys must never collide within one process.

use std::collections::HashSet;

use protocol::ConnectionToken;

#[test]
fn a_million_mints_never_collide() {
    let mut seen = HashSet::with_capacity(1_000_000);
    for _ in 0..1_000_000u32 {
        let token = ConnectionToken::mint(false, false).expect("mint token");
        assert!(
            seen.insert(token.key),
            "duplicate session key {:08x?}",
            token.key
        );
    }
}
