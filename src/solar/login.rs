use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::Client;
use crate::error::Error;
use crate::modbus::{Adu, FunctionCall};

type HmacSha256 = Hmac<Sha256>;

pub const LOGIN_FUNCTION: u8 = 0x41;

const LOGIN_INIT: u8 = 0x24;
const LOGIN_RESPONSE: u8 = 0x25;

// offset and length of the device challenge in the init response
const CHALLENGE_OFFSET: usize = 2;
const CHALLENGE_LEN: usize = 16;

// not randomised; whether the device checks it is unknown
const CLIENT_CHALLENGE: [u8; 16] = [
    41, 42, 43, 44, 45, 46, 47, 48, 41, 42, 43, 44, 45, 46, 47, 48,
];

const ACCEPTED: u8 = 0x00;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginState {
    Idle,
    InitSent,
    ChallengeReceived,
    ResponseSent,
    Authenticated,
    Rejected(u8),
}

/// `HMAC-SHA256(key = SHA256(password), challenge)`
pub fn login_digest(password: &str, challenge: &[u8]) -> Result<[u8; 32], Error> {
    let key = Sha256::digest(password.as_bytes());

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| Error::HmacKey)?;
    mac.update(challenge);

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

pub fn init_request() -> Vec<u8> {
    vec![LOGIN_INIT, 1, 0]
}

/// Pulls the 16 byte device challenge out of a login init response.
pub fn parse_challenge(data: &[u8]) -> Result<[u8; CHALLENGE_LEN], Error> {
    let end = CHALLENGE_OFFSET + CHALLENGE_LEN;
    if data.len() < end {
        return Err(Error::ShortResponse {
            expected: end,
            actual: data.len(),
        });
    }

    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge.copy_from_slice(&data[CHALLENGE_OFFSET..end]);
    Ok(challenge)
}

/// Builds the second login request:
/// subcommand, total length, client challenge, username and digest, the
/// last two prefixed with their length.
pub fn response_request(username: &str, digest: &[u8]) -> Result<Vec<u8>, Error> {
    let total = CLIENT_CHALLENGE.len() + 1 + username.len() + 1 + digest.len();
    let total = u8::try_from(total).map_err(|_| Error::UsernameTooLong(username.len()))?;

    let mut request = Vec::with_capacity(2 + total as usize);
    request.push(LOGIN_RESPONSE);
    request.push(total);
    request.extend_from_slice(&CLIENT_CHALLENGE);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(digest.len() as u8);
    request.extend_from_slice(digest);

    Ok(request)
}

/// Result code of the challenge response. The payload ends in
/// `..., <code>, <trailer>`; only 0 is known to mean success.
pub fn result_code(data: &[u8]) -> Result<u8, Error> {
    if data.len() < 2 {
        return Err(Error::ShortResponse {
            expected: 2,
            actual: data.len(),
        });
    }
    Ok(data[data.len() - 2])
}

struct Handshake {
    state: LoginState,
}

impl Handshake {
    fn advance(&mut self, next: LoginState) {
        debug!("login {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl<C> Client<C>
where
    C: FunctionCall + ?Sized,
{
    /// Runs the two step login handshake under the client's login timeout.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), Error> {
        let timeout = self.login_timeout;
        info!("logging in as {}", username);

        let mut handshake = Handshake {
            state: LoginState::Idle,
        };
        let result = tokio::time::timeout(
            timeout,
            self.handshake(&mut handshake, username, password),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))
        .and_then(|r| r);

        match &result {
            Ok(()) => info!("logged in as {}", username),
            Err(e) => warn!("login failed in state {:?}: {}", handshake.state, e),
        }
        result
    }

    async fn handshake(
        &self,
        handshake: &mut Handshake,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        let conn = self.connection();

        handshake.advance(LoginState::InitSent);
        let init = login_call(conn.as_ref(), init_request()).await?;
        let challenge = parse_challenge(&init.data)?;
        handshake.advance(LoginState::ChallengeReceived);

        let digest = login_digest(password, &challenge)?;
        let request = response_request(username, &digest)?;

        // the device refuses an immediate second step
        tokio::time::sleep(self.login_delay).await;

        handshake.advance(LoginState::ResponseSent);
        let response = login_call(conn.as_ref(), request).await?;
        debug!("login response data={:?}", response.data);

        match result_code(&response.data)? {
            ACCEPTED => {
                handshake.advance(LoginState::Authenticated);
                Ok(())
            }
            code => {
                handshake.advance(LoginState::Rejected(code));
                Err(Error::LoginRejected { code })
            }
        }
    }
}

async fn login_call<C>(conn: &C, data: Vec<u8>) -> Result<Adu, Error>
where
    C: FunctionCall + ?Sized,
{
    conn.function_call(LOGIN_FUNCTION, data)
        .await?
        .check_exception()
}
