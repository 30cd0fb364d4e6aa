use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};

use crate::commons::error::{CaResult, Error};

//------------ Nonce signatures ----------------------------------------------

/// Signs a nonce with SHA-256 and the given key, returns the hex encoded
/// signature.
///
/// Workloads use this to prove possession of their certificate's key when
/// asking for their own revocation; the nonce is the certificate's decimal
/// serial number.
pub fn sign_nonce(key: &PKeyRef<Private>, nonce: &str) -> CaResult<String> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(nonce.as_bytes())?;
    Ok(hex::encode(signer.sign_to_vec()?))
}

/// Verifies a signature made by [`sign_nonce`].
pub fn verify_nonce<T: HasPublic>(key: &PKeyRef<T>, nonce: &str, signature: &str) -> CaResult<()> {
    let signature =
        hex::decode(signature).map_err(|e| Error::SignatureInvalid(format!("signature is not hex: {}", e)))?;

    let mut verifier = Verifier::new(MessageDigest::sha256(), key)?;
    verifier.update(nonce.as_bytes())?;
    // OpenSSL reports some malformed signatures as errors rather than a
    // failed verification.
    match verifier.verify(&signature) {
        Ok(true) => Ok(()),
        _ => Err(Error::SignatureInvalid("signature does not match certificate key".to_string())),
    }
}

//------------ Request tokens ------------------------------------------------

/// Computes the HMAC-SHA256 token authenticating a request body.
pub fn request_token(auth_key: &[u8], body: &[u8]) -> CaResult<Vec<u8>> {
    let key = PKey::hmac(auth_key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(body)?;
    Ok(signer.sign_to_vec()?)
}

/// Checks a request token in constant time.
pub fn verify_request_token(auth_key: &[u8], body: &[u8], token: &[u8]) -> CaResult<()> {
    let expected = request_token(auth_key, body)?;
    if expected.len() == token.len() && memcmp::eq(&expected, token) {
        Ok(())
    } else {
        Err(Error::Unauthorized("invalid request token".to_string()))
    }
}

/// Compares two secrets in constant time.
pub fn secrets_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && memcmp::eq(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::KeyAlgorithm;

    #[test]
    fn nonce_signatures() {
        let key = KeyAlgorithm::EcdsaP256.generate().unwrap();
        let other = KeyAlgorithm::EcdsaP256.generate().unwrap();

        let sig = sign_nonce(&key, "12345").unwrap();
        verify_nonce(&key, "12345", &sig).unwrap();

        assert!(matches!(verify_nonce(&key, "12346", &sig), Err(Error::SignatureInvalid(_))));
        assert!(matches!(verify_nonce(&other, "12345", &sig), Err(Error::SignatureInvalid(_))));
        assert!(matches!(verify_nonce(&key, "12345", "zz"), Err(Error::SignatureInvalid(_))));
    }

    #[test]
    fn request_tokens() {
        let token = request_token(b"0123456789abcdef", b"body").unwrap();
        verify_request_token(b"0123456789abcdef", b"body", &token).unwrap();
        assert!(verify_request_token(b"0123456789abcdef", b"other", &token).is_err());
        assert!(verify_request_token(b"another-key-0000", b"body", &token).is_err());
        assert!(verify_request_token(b"0123456789abcdef", b"body", &token[1..]).is_err());
    }
}
