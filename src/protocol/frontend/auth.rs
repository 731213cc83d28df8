//! Authentication messages and password digests.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

type HmacSha256 = Hmac<Sha256>;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute MD5 password hash.
///
/// PostgreSQL MD5 password format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC error: {}", e)))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// SCRAM-SHA-256 client without channel binding.
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// GS2 header for "client does not support channel binding".
    const GS2_HEADER: &'static str = "n,,";

    /// Create a new SCRAM client with a random 24-byte nonce.
    ///
    /// The username is left empty; the server uses the one from the startup packet.
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);
        Self::with_nonce("", password, &STANDARD.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            nonce: nonce.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// Generate the client-first-message.
    pub fn client_first_message(&self) -> String {
        format!("{}{}", Self::GS2_HEADER, self.client_first_bare())
    }

    /// Process server-first-message and generate client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse::<u32>().ok();
            }
        }

        let missing = |what: &str| Error::Auth(format!("Missing {} in server-first-message", what));
        let combined_nonce = combined_nonce.ok_or_else(|| missing("nonce"))?;
        let salt_b64 = salt_b64.ok_or_else(|| missing("salt"))?;
        let iterations = iterations.ok_or_else(|| missing("iterations"))?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(Error::Auth(
                "Server nonce doesn't start with client nonce".into(),
            ));
        }

        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|e| Error::Auth(format!("Invalid salt: {}", e)))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let client_final_without_proof = format!(
            "c={},r={}",
            STANDARD.encode(Self::GS2_HEADER),
            combined_nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = [0u8; 32];
        for (out, (key, sig)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *out = key ^ sig;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            STANDARD.encode(proof)
        ))
    }

    /// Verify server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("SCRAM error from server: {}", err)));
        }
        let signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("Invalid server-final-message format".into()))?;
        let signature = STANDARD
            .decode(signature_b64)
            .map_err(|e| Error::Auth(format!("Invalid server signature: {}", e)))?;

        let (Some(salted_password), Some(auth_message)) =
            (self.salted_password.as_ref(), self.auth_message.as_ref())
        else {
            return Err(Error::Auth("server-final-message before server-first".into()));
        };

        let server_key = hmac(salted_password, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;
        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("Server signature verification failed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        let result = md5_password("postgres", "password", &[0x01, 0x02, 0x03, 0x04]);
        assert!(result.starts_with("md5"));
        assert_eq!(result.len(), 35);
        assert_ne!(
            result,
            md5_password("postgres", "password", &[0x04, 0x03, 0x02, 0x01])
        );
    }

    #[test]
    fn test_password_message() {
        let mut buf = Vec::new();
        write_password(&mut buf, "secret");
        assert_eq!(buf[0], b'p');
        assert!(buf.ends_with(b"secret\0"));
    }

    // Exchange from RFC 7677 section 3.
    #[test]
    fn test_scram_rfc7677() {
        let mut client = ScramClient::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO");
        assert_eq!(client.client_first_message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = client
            .process_server_first(
                "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        client
            .verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(client.verify_server_final("v=AAAA").is_err());
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("", "pw", "abc");
        assert!(matches!(
            client.process_server_first("r=xyz,s=AAAA,i=4096"),
            Err(Error::Auth(_))
        ));
    }
}
