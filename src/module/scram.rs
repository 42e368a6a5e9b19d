//! SCRAM-SHA-256 client (RFC 5802, RFC 7677), without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use super::sasl::Mechanism;
use crate::config::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// GS2 header for "no channel binding, no authzid".
const GS2_HEADER: &str = "n,,";
const NONCE_LEN: usize = 24;
const MIN_ITERATIONS: u32 = 4096;

enum Step {
    Initial,
    ClientFirstSent { client_first_bare: String },
    ClientFinalSent { server_signature: Vec<u8> },
    Done,
}

pub(super) struct ScramSha256 {
    username: String,
    password: String,
    client_nonce: String,
    step: Step,
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| e.to_string())?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// PBKDF2-HMAC-SHA-256 with a single output block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, String> {
    let mut first = salt.to_vec();
    first.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &first)?;
    let mut result = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u)?;
        for (r, b) in result.iter_mut().zip(&u) {
            *r ^= b;
        }
    }
    Ok(result)
}

/// `=` and `,` are escaped in SCRAM usernames.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn attribute<'a>(message: &'a str, key: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &part[2..])
    })
}

impl ScramSha256 {
    pub(super) fn new(credentials: &Credentials) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(&credentials.username, &credentials.password, nonce)
    }

    fn with_nonce(username: &str, password: &str, client_nonce: impl Into<String>) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: client_nonce.into(),
            step: Step::Initial,
        }
    }

    fn client_first(&mut self) -> String {
        let client_first_bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        let message = format!("{}{}", GS2_HEADER, client_first_bare);
        self.step = Step::ClientFirstSent { client_first_bare };
        message
    }

    fn client_final(&mut self, server_first: &str) -> Result<String, String> {
        let Step::ClientFirstSent { client_first_bare } = &self.step else {
            return Err("unexpected SCRAM challenge".to_string());
        };
        if server_first.starts_with("m=") {
            return Err("unsupported SCRAM extension".to_string());
        }
        let nonce = attribute(server_first, 'r').ok_or("SCRAM challenge without nonce")?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err("SCRAM server nonce does not extend ours".to_string());
        }
        let salt = attribute(server_first, 's')
            .ok_or("SCRAM challenge without salt")
            .and_then(|s| BASE64.decode(s).map_err(|_| "invalid SCRAM salt"))?;
        let iterations: u32 = attribute(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .filter(|i| *i > 0)
            .ok_or("invalid SCRAM iteration count")?;
        if iterations < MIN_ITERATIONS {
            tracing::warn!(iterations, "SCRAM iteration count below recommended minimum");
        }

        let channel_binding = BASE64.encode(GS2_HEADER);
        let without_proof = format!("c={},r={}", channel_binding, nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

        let salted_password = hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(&client_signature)
            .map(|(k, s)| k ^ s)
            .collect();
        let server_key = hmac(&salted_password, b"Server Key")?;
        let server_signature = hmac(&server_key, auth_message.as_bytes())?;

        self.step = Step::ClientFinalSent { server_signature };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    fn verify_server_final(&mut self, server_final: &str) -> Result<(), String> {
        let Step::ClientFinalSent { server_signature } = &self.step else {
            return Err("unexpected SCRAM server final message".to_string());
        };
        if let Some(error) = attribute(server_final, 'e') {
            return Err(format!("SCRAM server error: {}", error));
        }
        let verifier = attribute(server_final, 'v')
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or("SCRAM server final message without verifier")?;
        if &verifier != server_signature {
            return Err("SCRAM server signature mismatch".to_string());
        }
        self.step = Step::Done;
        Ok(())
    }
}

impl Mechanism for ScramSha256 {
    fn initial_response(&mut self) -> Result<Vec<u8>, String> {
        Ok(self.client_first().into_bytes())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        let challenge = std::str::from_utf8(challenge).map_err(|_| "SCRAM challenge is not UTF-8")?;
        match self.step {
            // Server final sent as a challenge (RFC 6120 §6.3.10); answered empty.
            Step::ClientFinalSent { .. } => self.verify_server_final(challenge).map(|()| Vec::new()),
            _ => self.client_final(challenge).map(String::into_bytes),
        }
    }

    fn verify_success(&mut self, additional: &[u8]) -> Result<(), String> {
        if matches!(self.step, Step::Done) && additional.is_empty() {
            return Ok(());
        }
        let message = std::str::from_utf8(additional).map_err(|_| "SCRAM success is not UTF-8")?;
        self.verify_server_final(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    fn rfc7677_client() -> ScramSha256 {
        ScramSha256::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO")
    }

    #[test]
    fn test_rfc7677_exchange() {
        let mut scram = rfc7677_client();
        assert_eq!(scram.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
        assert_eq!(
            scram.client_final(SERVER_FIRST).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        assert!(scram
            .verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .is_ok());
    }

    #[test]
    fn test_server_final_in_challenge_then_empty_success() {
        let mut scram = rfc7677_client();
        scram.initial_response().unwrap();
        scram.respond(SERVER_FIRST.as_bytes()).unwrap();
        let reply = scram
            .respond(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(reply.is_empty());
        assert!(scram.verify_success(b"").is_ok());
    }

    #[test]
    fn test_empty_success_without_server_final_rejected() {
        let mut scram = rfc7677_client();
        scram.initial_response().unwrap();
        scram.respond(SERVER_FIRST.as_bytes()).unwrap();
        assert!(scram.verify_success(b"").is_err());
    }

    #[test]
    fn test_wrong_server_signature_rejected() {
        let mut scram = rfc7677_client();
        scram.client_first();
        scram.client_final(SERVER_FIRST).unwrap();
        assert!(scram
            .verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .is_err());
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut scram = rfc7677_client();
        scram.client_first();
        assert!(scram
            .client_final("r=somebodyElse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .is_err());
    }

    #[test]
    fn test_server_error_attribute() {
        let mut scram = rfc7677_client();
        scram.client_first();
        scram.client_final(SERVER_FIRST).unwrap();
        let err = scram.verify_server_final("e=invalid-proof").unwrap_err();
        assert!(err.contains("invalid-proof"));
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
