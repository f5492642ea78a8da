//! Identity resolution
//!
//! Maps an inbound credential bundle to exactly one identity. The
//! order is fixed: credential match first, then device lookup, then a
//! credential retry (the fallback the safer of the two legacy variants
//! performed; it is an idempotent re-check given the ordering).

use fleetgate_store::{IdentityRecord, Store};
use serde::Deserialize;
use tracing::debug;

use crate::{secret, CoreError, CoreResult};

/// Inbound credential bundle: any combination of handle+secret and a
/// device identifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub handle: Option<String>,
    pub secret: Option<String>,
    pub device_id: Option<String>,
}

/// Resolve the credentials to a single identity, or fail with
/// `NotAuthenticated`. First match wins.
pub fn resolve_identity(store: &dyn Store, creds: &Credentials) -> CoreResult<IdentityRecord> {
    let pair = match (&creds.handle, &creds.secret) {
        (Some(h), Some(s)) => Some((h.as_str(), s.as_str())),
        _ => None,
    };

    if let Some((handle, secret)) = pair {
        if let Some(identity) = credential_match(store, handle, secret)? {
            return Ok(identity);
        }
    }

    if let Some(device_id) = &creds.device_id {
        if let Some(identity) = store.identity_by_device(device_id)? {
            debug!(identity_id = %identity.id, "Resolved identity by bound device");
            return Ok(identity);
        }

        // Fallback after a failed device lookup: retry the credential
        // match. Can only re-fail, but the ordering is contractual.
        if let Some((handle, secret)) = pair {
            if let Some(identity) = credential_match(store, handle, secret)? {
                return Ok(identity);
            }
        }
    }

    Err(CoreError::NotAuthenticated)
}

/// Look up by handle and verify the secret against the stored hash.
/// Identities without a stored hash (fresh registrations) can never
/// match by credentials.
fn credential_match(
    store: &dyn Store,
    handle: &str,
    secret: &str,
) -> CoreResult<Option<IdentityRecord>> {
    let Some(identity) = store.identity_by_handle(handle)? else {
        return Ok(None);
    };
    let Some(hash) = &identity.secret_hash else {
        return Ok(None);
    };
    if secret::verify_secret(secret, hash)? {
        debug!(identity_id = %identity.id, "Resolved identity by credentials");
        Ok(Some(identity))
    } else {
        Ok(None)
    }
}
