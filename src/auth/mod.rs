//! Request authentication for Covenant
//!
//! Service backends authenticate with the `x-service-key` header issued at
//! registration. The resolved [`ServiceDoc`] identifies the caller for the
//! rest of the request.

use hyper::header::HeaderMap;

use crate::db::schemas::ServiceDoc;
use crate::repo::ConsentRepository;
use crate::types::{CovenantError, Result};

pub const SERVICE_KEY_HEADER: &str = "x-service-key";

/// Resolve the calling service from the request headers
pub async fn authenticate_service(
    repo: &dyn ConsentRepository,
    headers: &HeaderMap,
) -> Result<ServiceDoc> {
    let key = headers
        .get(SERVICE_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            CovenantError::Unauthorized("Missing x-service-key header".into())
        })?;

    repo.service_by_key(key)
        .await?
        .ok_or_else(|| CovenantError::Unauthorized("Unknown service key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let repo = MemoryRepository::new();
        let headers = HeaderMap::new();
        let err = authenticate_service(&repo, &headers).await.unwrap_err();
        assert!(matches!(err, CovenantError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn unknown_key_is_unauthorized() {
        let repo = MemoryRepository::new();
        let mut headers = HeaderMap::new();
        headers.insert(SERVICE_KEY_HEADER, "nope".parse().unwrap());
        let err = authenticate_service(&repo, &headers).await.unwrap_err();
        assert!(matches!(err, CovenantError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn known_key_resolves_service() {
        let repo = MemoryRepository::new();
        let service_id = repo
            .add_service(crate::db::schemas::ServiceDoc {
                name: "alpha".into(),
                service_key: "key-alpha".into(),
                ..Default::default()
            })
            .await;
        let mut headers = HeaderMap::new();
        headers.insert(SERVICE_KEY_HEADER, "key-alpha".parse().unwrap());
        let resolved = authenticate_service(&repo, &headers).await.unwrap();
        assert_eq!(resolved._id, Some(service_id));
    }
}
