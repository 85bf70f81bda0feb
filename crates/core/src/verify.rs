//! Pure kernel of the verification pool.
//!
//! Verification of a message combines the signature check with an equality
//! check of the certificate's proof-object hash against the hash the core
//! computed for the claim. Hosts run this on a thread pool in production
//! and inline in simulation; either way the result comes back as an event.

use crate::{Action, Event};

/// Execute one delegated verification action.
///
/// Returns the callback event for verification actions and `None` for
/// everything else.
pub fn run_verification(action: &Action) -> Option<Event> {
    match action {
        Action::VerifyVote {
            vote,
            public_key,
            obj_hash,
        } => {
            let valid = vote.cert.verify(public_key) && vote.cert.obj_hash() == *obj_hash;
            Some(Event::VoteVerified {
                vote: vote.clone(),
                valid,
            })
        }

        Action::VerifyBlame {
            blame,
            public_key,
            obj_hash,
        } => {
            let valid = blame.cert.verify(public_key) && blame.cert.obj_hash() == *obj_hash;
            Some(Event::BlameVerified {
                blame: blame.clone(),
                valid,
            })
        }

        Action::VerifyEcho {
            echo,
            public_key,
            obj_hash,
        } => {
            let valid = echo.cert.verify(public_key) && echo.cert.obj_hash() == *obj_hash;
            Some(Event::EchoVerified {
                echo: echo.clone(),
                valid,
            })
        }

        Action::VerifyAck {
            ack,
            public_key,
            obj_hash,
        } => {
            let valid = ack.cert.verify(public_key) && ack.cert.obj_hash() == *obj_hash;
            Some(Event::AckVerified {
                ack: ack.clone(),
                valid,
            })
        }

        Action::VerifyPreCommit {
            pc,
            public_key,
            obj_hash,
        } => {
            let valid = pc.cert.verify(public_key) && pc.cert.obj_hash() == *obj_hash;
            Some(Event::PreCommitVerified {
                pc: pc.clone(),
                valid,
            })
        }

        Action::VerifyNotify {
            notify,
            public_keys,
            quorum,
            obj_hash,
        } => {
            let valid =
                notify.qc.obj_hash() == *obj_hash && notify.qc.verify(public_keys, *quorum);
            Some(Event::NotifyVerified {
                notify: notify.clone(),
                valid,
            })
        }

        Action::VerifyBlameNotify {
            bn,
            public_keys,
            quorum,
            blame_obj_hash,
            hqc_obj_hash,
            hqc_genesis,
        } => {
            let blame_ok =
                bn.qc.obj_hash() == *blame_obj_hash && bn.qc.verify(public_keys, *quorum);
            let hqc_ok = bn.hqc_qc.obj_hash() == *hqc_obj_hash
                && (*hqc_genesis || bn.hqc_qc.verify(public_keys, *quorum));
            Some(Event::BlameNotifyVerified {
                bn: bn.clone(),
                valid: blame_ok && hqc_ok,
            })
        }

        Action::VerifyProposalQc {
            blk_hash,
            qc,
            public_keys,
            quorum,
            obj_hash,
        } => {
            let valid = qc.obj_hash() == *obj_hash && qc.verify(public_keys, *quorum);
            Some(Event::ProposalQcVerified {
                blk_hash: *blk_hash,
                valid,
            })
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_messages::Vote;
    use tessera_types::{vote_obj_hash, Hash, KeyPair, PartialCert, ReplicaId};

    #[test]
    fn vote_verification_checks_domain_hash() {
        let key = KeyPair::from_seed(&[1u8; 32]);
        let blk_hash = Hash::digest(b"blk");
        let vote = Vote {
            voter: ReplicaId(0),
            blk_hash,
            cert: PartialCert::create(&key, vote_obj_hash(&blk_hash)),
        };

        let action = Action::VerifyVote {
            vote: vote.clone(),
            public_key: key.public_key(),
            obj_hash: vote_obj_hash(&blk_hash),
        };
        match run_verification(&action) {
            Some(Event::VoteVerified { valid, .. }) => assert!(valid),
            other => panic!("unexpected {other:?}"),
        }

        // Same signature claimed for a different block must fail.
        let action = Action::VerifyVote {
            vote,
            public_key: key.public_key(),
            obj_hash: vote_obj_hash(&Hash::digest(b"other")),
        };
        match run_verification(&action) {
            Some(Event::VoteVerified { valid, .. }) => assert!(!valid),
            other => panic!("unexpected {other:?}"),
        }
    }
}
