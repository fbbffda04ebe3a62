use burrowmq_core::TenantId;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct TenantCred {
    pub tenant_id: TenantId,
    pub secret: String,
}

/// Maps access key ids to tenants. Injected everywhere it is needed; the
/// dashboard runs as the single ambient operator tenant.
pub struct TenantDirectory {
    keys: RwLock<HashMap<String, TenantCred>>,
    ambient: TenantId,
}

impl TenantDirectory {
    pub fn new(ambient: TenantId) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            ambient,
        }
    }

    /// Single-operator deployment: one key pair from the environment,
    /// tenant id 1. Falls back to dev credentials so a bare `cargo run`
    /// works out of the box.
    pub fn from_env() -> Self {
        let access_key =
            std::env::var("ACCESS_KEY_ID").unwrap_or_else(|_| "DEV_ACCESS_KEY_ID".into());
        let secret =
            std::env::var("SECRET_ACCESS_KEY").unwrap_or_else(|_| "DEV_SECRET_ACCESS_KEY".into());
        let dir = Self::new(1);
        dir.insert(&access_key, 1, &secret);
        dir
    }

    pub fn insert(&self, access_key_id: &str, tenant_id: TenantId, secret: &str) {
        self.keys.write().insert(
            access_key_id.to_string(),
            TenantCred {
                tenant_id,
                secret: secret.to_string(),
            },
        );
    }

    /// `region` is part of the credential scope but does not participate in
    /// dispatch in a single-region deployment.
    pub fn resolve(&self, access_key_id: &str, _region: &str) -> Option<TenantCred> {
        self.keys.read().get(access_key_id).cloned()
    }

    pub fn current_tenant(&self) -> TenantId {
        self.ambient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_known_and_unknown_keys() {
        let dir = TenantDirectory::new(1);
        dir.insert("AKIDEXAMPLE", 7, "s3cret");

        let cred = dir.resolve("AKIDEXAMPLE", "us-east-1").unwrap();
        assert_eq!(cred.tenant_id, 7);
        assert_eq!(cred.secret, "s3cret");
        assert!(dir.resolve("NOPE", "us-east-1").is_none());
    }
}
