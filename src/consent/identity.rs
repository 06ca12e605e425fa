//! Identity reconciliation
//!
//! Once both sides of an exchange are verified they belong to the same
//! person, so their identifiers must end up under one user. Membership uses
//! set semantics and the commit order is user first, then identifiers: a
//! replay after a partial failure finds the identifiers already pointing at
//! the user and short-circuits.

use bson::oid::ObjectId;
use tracing::debug;

use crate::db::schemas::{IdentifierDoc, UserDoc};
use crate::repo::ConsentRepository;
use crate::types::{CovenantError, Result};

fn push_unique<T: PartialEq>(vec: &mut Vec<T>, value: T) -> bool {
    if vec.contains(&value) {
        return false;
    }
    vec.push(value);
    true
}

/// Add an identifier's membership to a user. Returns true if anything changed.
fn adopt(user: &mut UserDoc, identifier: &IdentifierDoc) -> Result<bool> {
    let id = identifier
        ._id
        .ok_or_else(|| CovenantError::Internal("identifier has no id".into()))?;
    let mut changed = push_unique(&mut user.identifiers, id);
    changed |= push_unique(&mut user.emails, identifier.email.clone());
    Ok(changed)
}

/// Merge the two identifiers of a verified exchange under one user.
///
/// The identifiers are mutated to point at the surviving user and persisted
/// along with it. Idempotent: a second call with the same identifiers changes
/// nothing. Symmetric: swapping the arguments yields the same membership.
pub async fn reconcile_identifiers(
    repo: &dyn ConsentRepository,
    a: &mut IdentifierDoc,
    b: &mut IdentifierDoc,
) -> Result<UserDoc> {
    match (a.user, b.user) {
        (Some(ua), Some(ub)) if ua == ub => {
            // Already reconciled; make sure membership is complete
            let mut user = require_user(repo, &ua).await?;
            let changed = adopt(&mut user, a)? | adopt(&mut user, b)?;
            if changed {
                repo.save_user(&user).await?;
            }
            Ok(user)
        }
        (Some(ua), Some(ub)) => {
            // Two distinct users; absorb the younger into the older so both
            // argument orders converge on the same survivor
            let (winner_id, loser_id) = if ua <= ub { (ua, ub) } else { (ub, ua) };
            let mut winner = require_user(repo, &winner_id).await?;
            let loser = require_user(repo, &loser_id).await?;

            debug!(
                winner = %winner_id.to_hex(),
                loser = %loser_id.to_hex(),
                "merging users during reconciliation"
            );

            for id in &loser.identifiers {
                push_unique(&mut winner.identifiers, *id);
            }
            for email in &loser.emails {
                push_unique(&mut winner.emails, email.clone());
            }
            adopt(&mut winner, a)?;
            adopt(&mut winner, b)?;

            repo.save_user(&winner).await?;

            // Repoint every identifier the loser owned, then retire it
            for id in &loser.identifiers {
                if let Some(mut other) = repo.identifier_by_id(id).await? {
                    if other.user != Some(winner_id) {
                        other.user = Some(winner_id);
                        repo.save_identifier(&other).await?;
                    }
                }
            }
            a.user = Some(winner_id);
            b.user = Some(winner_id);
            repo.save_identifier(a).await?;
            repo.save_identifier(b).await?;
            repo.delete_user(&loser_id).await?;

            Ok(winner)
        }
        (Some(user_id), None) | (None, Some(user_id)) => {
            let mut user = require_user(repo, &user_id).await?;
            adopt(&mut user, a)?;
            adopt(&mut user, b)?;
            repo.save_user(&user).await?;

            a.user = Some(user_id);
            b.user = Some(user_id);
            repo.save_identifier(a).await?;
            repo.save_identifier(b).await?;

            Ok(user)
        }
        (None, None) => {
            // Neither side is attached yet. Another identifier sharing one of
            // the emails may already carry a user; join it if so.
            let emails = vec![a.email.clone(), b.email.clone()];
            let siblings = repo.identifiers_matching_emails(&emails).await?;
            let existing = siblings.iter().find_map(|i| i.user);

            let mut user = match existing {
                Some(user_id) => require_user(repo, &user_id).await?,
                None => UserDoc::default(),
            };

            adopt_or_stage(&mut user, a);
            adopt_or_stage(&mut user, b);

            let user_id = match user._id {
                Some(id) => {
                    repo.save_user(&user).await?;
                    id
                }
                None => {
                    let id = repo.insert_user(user.clone()).await?;
                    user._id = Some(id);
                    id
                }
            };

            a.user = Some(user_id);
            b.user = Some(user_id);
            repo.save_identifier(a).await?;
            repo.save_identifier(b).await?;

            Ok(user)
        }
    }
}

fn adopt_or_stage(user: &mut UserDoc, identifier: &IdentifierDoc) {
    if let Some(id) = identifier._id {
        push_unique(&mut user.identifiers, id);
    }
    push_unique(&mut user.emails, identifier.email.clone());
}

async fn require_user(repo: &dyn ConsentRepository, id: &ObjectId) -> Result<UserDoc> {
    repo.user_by_id(id)
        .await?
        .ok_or_else(|| CovenantError::NotFound(format!("User {} not found", id.to_hex())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;

    async fn seeded_identifier(repo: &MemoryRepository, email: &str) -> IdentifierDoc {
        let doc = IdentifierDoc {
            service: ObjectId::new(),
            email: email.into(),
            ..Default::default()
        };
        let id = repo.insert_identifier(doc.clone()).await.unwrap();
        repo.identifier_by_id(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn creates_user_when_neither_side_has_one() {
        let repo = MemoryRepository::new();
        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let user = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();

        assert_eq!(user.identifiers.len(), 2);
        assert_eq!(user.emails, vec!["a@x.test", "b@y.test"]);
        assert_eq!(a.user, user._id);
        assert_eq!(b.user, user._id);

        let stored = repo.identifier_by_id(&a._id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.user, user._id);
    }

    #[tokio::test]
    async fn replay_is_a_no_op() {
        let repo = MemoryRepository::new();
        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let first = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();
        let second = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();

        assert_eq!(first._id, second._id);
        assert_eq!(second.identifiers.len(), 2);
        assert_eq!(second.emails.len(), 2);
    }

    #[tokio::test]
    async fn argument_order_does_not_matter() {
        let repo = MemoryRepository::new();
        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let forward = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();
        let backward = reconcile_identifiers(&repo, &mut b, &mut a).await.unwrap();

        assert_eq!(forward._id, backward._id);
        let mut fw: Vec<_> = forward.identifiers.clone();
        let mut bw: Vec<_> = backward.identifiers.clone();
        fw.sort();
        bw.sort();
        assert_eq!(fw, bw);
    }

    #[tokio::test]
    async fn attaches_to_existing_user_of_one_side() {
        let repo = MemoryRepository::new();
        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let user_id = repo
            .insert_user(UserDoc {
                identifiers: vec![a._id.unwrap()],
                emails: vec!["a@x.test".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        a.user = Some(user_id);
        repo.save_identifier(&a).await.unwrap();

        let user = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();

        assert_eq!(user._id, Some(user_id));
        assert!(user.identifiers.contains(&b._id.unwrap()));
        assert!(user.emails.contains(&"b@y.test".to_string()));
        assert_eq!(b.user, Some(user_id));
    }

    #[tokio::test]
    async fn joins_user_found_through_email_sibling() {
        let repo = MemoryRepository::new();

        // A third identifier with the same email already belongs to a user
        let mut sibling = seeded_identifier(&repo, "a@x.test").await;
        let user_id = repo
            .insert_user(UserDoc {
                identifiers: vec![sibling._id.unwrap()],
                emails: vec!["a@x.test".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        sibling.user = Some(user_id);
        repo.save_identifier(&sibling).await.unwrap();

        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let user = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();

        assert_eq!(user._id, Some(user_id));
        assert_eq!(user.identifiers.len(), 3);
    }

    #[tokio::test]
    async fn merges_two_distinct_users() {
        let repo = MemoryRepository::new();
        let mut a = seeded_identifier(&repo, "a@x.test").await;
        let mut b = seeded_identifier(&repo, "b@y.test").await;

        let ua = repo
            .insert_user(UserDoc {
                identifiers: vec![a._id.unwrap()],
                emails: vec!["a@x.test".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let ub = repo
            .insert_user(UserDoc {
                identifiers: vec![b._id.unwrap()],
                emails: vec!["b@y.test".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        a.user = Some(ua);
        b.user = Some(ub);
        repo.save_identifier(&a).await.unwrap();
        repo.save_identifier(&b).await.unwrap();

        let user = reconcile_identifiers(&repo, &mut a, &mut b).await.unwrap();

        let survivor = if ua <= ub { ua } else { ub };
        let retired = if ua <= ub { ub } else { ua };
        assert_eq!(user._id, Some(survivor));
        assert_eq!(user.identifiers.len(), 2);
        assert_eq!(a.user, Some(survivor));
        assert_eq!(b.user, Some(survivor));
        assert!(repo.user_by_id(&retired).await.unwrap().is_none());
    }
}
