/// Which side yields when both peers of a pair offer at once.
///
/// Derived from the two relay-assigned ids alone, so both ends agree on the
/// assignment without exchanging anything. The relay guarantees ids are
/// unique within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionRole {
    /// Rolls back its own offer and answers the remote one.
    Polite,
    /// Ignores the remote offer; its own offer proceeds.
    Impolite,
}

impl CollisionRole {
    /// The greater id (byte-wise `str` order) is impolite.
    pub fn compute(local_id: &str, remote_id: &str) -> Self {
        if local_id > remote_id {
            CollisionRole::Impolite
        } else {
            CollisionRole::Polite
        }
    }

    pub fn is_polite(self) -> bool {
        self == CollisionRole::Polite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_complementary_for_every_pair() {
        let ids = [
            "a",
            "b",
            "A",
            "peer-10",
            "peer-9",
            "3f2a9c1e-0d4b-4e7a-9b1f-5c6d7e8f9a0b",
            "Xk2_s9",
            "",
        ];
        for local in ids {
            for remote in ids {
                if local == remote {
                    continue;
                }
                let mine = CollisionRole::compute(local, remote);
                let theirs = CollisionRole::compute(remote, local);
                assert_ne!(mine, theirs, "{local} vs {remote}");
                assert_eq!(mine, CollisionRole::compute(local, remote));
            }
        }
    }

    #[test]
    fn greater_id_is_impolite() {
        assert_eq!(CollisionRole::compute("b", "a"), CollisionRole::Impolite);
        assert_eq!(CollisionRole::compute("a", "b"), CollisionRole::Polite);
        // Lexicographic, not numeric.
        assert_eq!(
            CollisionRole::compute("peer-9", "peer-10"),
            CollisionRole::Impolite
        );
    }
}
