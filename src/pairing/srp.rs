//! SRP-6a client over the RFC 5054 3072-bit group.
//!
//! Pair-setup runs SRP with SHA-512, g = 5 and the fixed username
//! "Pair-Setup"; the password is the PIN the Apple TV displays. Public
//! values serialize as fixed-width 384-byte big-endian buffers. Secret
//! material (the ephemeral private key, the session key and the proof) is
//! scrubbed on drop.

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::RemoteXpcError;

/// Username pair-setup always uses.
pub const SRP_USERNAME: &str = "Pair-Setup";

/// Width of a serialized public value, in bytes (3072 bits).
pub const KEY_LENGTH: usize = 384;

const GENERATOR: u8 = 5;

// RFC 5054 appendix A, the 3072-bit group (same prime as RFC 3526 group 15)
const N_3072_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Client side of one SRP session.
#[derive(Debug)]
pub struct SrpClient {
    private: Vec<u8>,
    public: Vec<u8>,
    session_key: Option<Vec<u8>>,
    proof: Option<Vec<u8>>,
}

impl SrpClient {
    /// Creates a client with a fresh 32-byte random ephemeral.
    pub fn new() -> Self {
        let mut private = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut private);
        Self::with_private(private)
    }

    /// Creates a client with a caller-supplied ephemeral (deterministic
    /// sessions for tests).
    pub fn with_private(private: [u8; 32]) -> Self {
        let n = prime();
        let a = BigUint::from_bytes_be(&private);
        let public = BigUint::from(GENERATOR).modpow(&a, &n);
        Self {
            private: private.to_vec(),
            public: pad(&public),
            session_key: None,
            proof: None,
        }
    }

    /// The client public value `A`, 384 bytes big-endian.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Processes the server's salt and public value `B`, deriving the
    /// session key `K` and the proof `M1`.
    pub fn process_challenge(
        &mut self,
        password: &str,
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<(), RemoteXpcError> {
        let n = prime();
        let g = BigUint::from(GENERATOR);

        let b_pub = BigUint::from_bytes_be(server_public);
        if (&b_pub % &n).bits() == 0 || b_pub <= BigUint::from(1u8) || b_pub >= &n - 1u8 {
            return Err(RemoteXpcError::Cryptography(
                "SRP server public key is out of range".into(),
            ));
        }

        // x = H(salt || H(username ":" password))
        let identity = sha512(&[SRP_USERNAME.as_bytes(), b":", password.as_bytes()]);
        let x = BigUint::from_bytes_be(&sha512(&[salt, &identity]));

        // k = H(N || pad(g))
        let k = BigUint::from_bytes_be(&sha512(&[&pad_big(&n), &pad(&g)]));

        // u = H(pad(A) || pad(B)) must be non-zero
        let u = BigUint::from_bytes_be(&sha512(&[&self.public, &pad(&b_pub)]));
        if u.bits() == 0 {
            return Err(RemoteXpcError::Cryptography(
                "SRP scrambling parameter is zero".into(),
            ));
        }

        // S = (B - k * g^x) ^ (a + u * x) mod N
        let a = BigUint::from_bytes_be(&self.private);
        let g_x = g.modpow(&x, &n);
        let base = ((&b_pub + &n) - (&k * &g_x) % &n) % &n;
        let exponent = &a + &u * &x;
        let premaster = base.modpow(&exponent, &n);

        // K = H(S)
        let session_key = sha512(&[&premaster.to_bytes_be()]);

        // M1 = H(H(N) xor H(g) || H(username) || salt || pad(A) || pad(B) || K)
        let hn = sha512(&[&pad_big(&n)]);
        let hg = sha512(&[&g.to_bytes_be()]);
        let hng: Vec<u8> = hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect();
        let hu = sha512(&[SRP_USERNAME.as_bytes()]);
        let proof = sha512(&[
            &hng,
            &hu,
            salt,
            &self.public,
            &pad(&b_pub),
            &session_key,
        ]);

        self.session_key = Some(session_key);
        self.proof = Some(proof);
        Ok(())
    }

    /// The shared session key `K`, once the challenge was processed.
    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    /// The client proof `M1`, once the challenge was processed.
    pub fn proof(&self) -> Option<&[u8]> {
        self.proof.as_deref()
    }

    /// Checks the server's proof `M2 = H(pad(A) || M1 || K)`.
    pub fn verify_server_proof(&self, m2: &[u8]) -> bool {
        match (&self.proof, &self.session_key) {
            (Some(m1), Some(k)) => sha512(&[&self.public, m1, k]) == m2,
            _ => false,
        }
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SrpClient {
    fn drop(&mut self) {
        scrub(&mut self.private);
        if let Some(key) = self.session_key.as_mut() {
            scrub(key);
        }
        if let Some(proof) = self.proof.as_mut() {
            scrub(proof);
        }
    }
}

fn scrub(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        // a plain loop; the values are gone before the allocation is reused
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}

fn prime() -> BigUint {
    BigUint::parse_bytes(N_3072_HEX.as_bytes(), 16).expect("N is a fixed constant")
}

/// Left-pads a big-endian value to the 384-byte group width.
fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; KEY_LENGTH.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

fn pad_big(n: &BigUint) -> Vec<u8> {
    pad(n)
}

fn sha512(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Server side of the exchange, mirrored here to prove the math agrees.
    struct SrpServer {
        private: BigUint,
        public: BigUint,
        verifier: BigUint,
        salt: Vec<u8>,
    }

    impl SrpServer {
        fn new(password: &str, salt: Vec<u8>, private: [u8; 32]) -> Self {
            let n = prime();
            let g = BigUint::from(GENERATOR);
            let identity = sha512(&[SRP_USERNAME.as_bytes(), b":", password.as_bytes()]);
            let x = BigUint::from_bytes_be(&sha512(&[&salt, &identity]));
            let verifier = g.modpow(&x, &n);
            let k = BigUint::from_bytes_be(&sha512(&[&pad_big(&n), &pad(&g)]));

            let b = BigUint::from_bytes_be(&private);
            // B = k*v + g^b mod N
            let public = (&k * &verifier + g.modpow(&b, &n)) % &n;
            Self {
                private: b,
                public,
                verifier,
                salt,
            }
        }

        fn session_key(&self, client_public: &[u8]) -> Vec<u8> {
            let n = prime();
            let a_pub = BigUint::from_bytes_be(client_public);
            let u = BigUint::from_bytes_be(&sha512(&[&pad(&a_pub), &pad(&self.public)]));
            // S = (A * v^u) ^ b mod N
            let premaster =
                (&a_pub * self.verifier.modpow(&u, &n)).modpow(&self.private, &n);
            sha512(&[&premaster.to_bytes_be()])
        }

        fn expected_proof(&self, client_public: &[u8]) -> Vec<u8> {
            let n = prime();
            let g = BigUint::from(GENERATOR);
            let key = self.session_key(client_public);
            let hn = sha512(&[&pad_big(&n)]);
            let hg = sha512(&[&g.to_bytes_be()]);
            let hng: Vec<u8> = hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect();
            let hu = sha512(&[SRP_USERNAME.as_bytes()]);
            sha512(&[
                &hng,
                &hu,
                &self.salt,
                &pad(&BigUint::from_bytes_be(client_public)),
                &pad(&self.public),
                &key,
            ])
        }
    }

    #[test]
    fn client_and_server_agree_on_m1() {
        let salt = vec![0x5Au8; 16];
        let server = SrpServer::new("3939", salt.clone(), [0x21; 32]);
        let mut client = SrpClient::with_private([0x42; 32]);

        client
            .process_challenge("3939", &salt, &pad(&server.public))
            .unwrap();
        let m1 = client.proof().unwrap();
        assert_eq!(m1, server.expected_proof(client.public_key()).as_slice());
        assert_eq!(
            client.session_key().unwrap(),
            server.session_key(client.public_key()).as_slice()
        );
    }

    #[test]
    fn public_keys_are_fixed_width() {
        let client = SrpClient::with_private([0x01; 32]);
        assert_eq!(client.public_key().len(), KEY_LENGTH);
    }

    #[test]
    fn out_of_range_server_public_is_rejected() {
        let mut client = SrpClient::with_private([0x42; 32]);
        // B = 0 mod N
        let err = client
            .process_challenge("0000", &[0u8; 16], &pad_big(&prime()))
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::Cryptography(_)));

        let err = client
            .process_challenge("0000", &[0u8; 16], &[0x01])
            .unwrap_err();
        assert!(matches!(err, RemoteXpcError::Cryptography(_)));
    }

    #[test]
    fn server_proof_round_trips() {
        let salt = vec![0x11u8; 16];
        let server = SrpServer::new("1234", salt.clone(), [0x33; 32]);
        let mut client = SrpClient::with_private([0x44; 32]);
        client
            .process_challenge("1234", &salt, &pad(&server.public))
            .unwrap();

        let m2 = sha512(&[
            client.public_key(),
            client.proof().unwrap(),
            client.session_key().unwrap(),
        ]);
        assert!(client.verify_server_proof(&m2));
        assert!(!client.verify_server_proof(&[0u8; 64]));
    }

    #[test]
    fn wrong_password_diverges() {
        let salt = vec![0x77u8; 16];
        let server = SrpServer::new("1234", salt.clone(), [0x55; 32]);
        let mut client = SrpClient::with_private([0x66; 32]);
        client
            .process_challenge("4321", &salt, &pad(&server.public))
            .unwrap();
        assert_ne!(
            client.proof().unwrap(),
            server.expected_proof(client.public_key()).as_slice()
        );
    }
}
