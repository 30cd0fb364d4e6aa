//! Revocation of a workload's own certificate.

use log::info;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::X509Ref;

use crate::commons::api::{Empty, RevokeRequest};
use crate::commons::crypto::{CertInfo, sign_nonce};
use crate::commons::error::{CaResult, Error};
use crate::commons::httpclient;

/// Builds the request revoking `cert`, signed with its key.
///
/// The serial number is the nonce, so the signature proves possession of
/// the key the certificate was issued for.
pub fn self_revoke_request(key: &PKeyRef<Private>, cert: &X509Ref) -> CaResult<RevokeRequest> {
    if !cert.public_key()?.public_eq(key) {
        return Err(Error::BadRequest("key does not belong to the certificate".to_string()));
    }
    let info = CertInfo::from_cert(cert)?;
    Ok(RevokeRequest {
        sign: Some(sign_nonce(key, &info.serial_number)?),
        nonce: Some(info.serial_number.clone()),
        serial: info.serial_number,
        authority_key_id: info.authority_key_id,
        ..Default::default()
    })
}

/// Asks the CA at `revoke_uri` to revoke `cert`.
pub async fn revoke_cert(revoke_uri: &str, key: &PKeyRef<Private>, cert: &X509Ref) -> CaResult<()> {
    let req = self_revoke_request(key, cert)?;
    let _: Empty = httpclient::post_json_with_response(revoke_uri, &req, None).await?;
    info!("revoked certificate {}", req.serial);
    Ok(())
}
