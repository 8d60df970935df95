#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{duplex, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

pub use huawei_solar_bridge::error::Error;
pub use huawei_solar_bridge::modbus::{Adu, AduCodec};
pub use huawei_solar_bridge::prelude::*;
pub use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Client connection plus the device end of an in-memory pipe.
pub fn pair(unit_id: u8) -> (Connection<DuplexStream>, FakeInverter<DuplexStream>) {
    let (client, device) = duplex(4096);
    (Connection::new(client, unit_id), FakeInverter::new(device))
}

/// The inverter side of a connection, speaking ADUs.
pub struct FakeInverter<T> {
    framed: Framed<T, AduCodec>,
}

impl<T> FakeInverter<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T) -> Self {
        Self {
            framed: Framed::new(stream, AduCodec),
        }
    }

    pub async fn recv(&mut self) -> Result<Adu> {
        match self.framed.next().await {
            Some(adu) => Ok(adu?),
            None => bail!("client hung up"),
        }
    }

    pub async fn reply(&mut self, request: &Adu, function_code: u8, data: Vec<u8>) -> Result<()> {
        let response = Adu::new(
            request.transaction_id(),
            request.unit_id(),
            function_code,
            data,
        );
        self.framed.send(response).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.framed.get_mut().write_all(bytes).await?;
        Ok(())
    }

    /// Answers every request with `handler` until the client hangs up.
    pub async fn serve<F>(mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(&Adu) -> (u8, Vec<u8>),
    {
        while let Some(request) = self.framed.next().await {
            let request = request?;
            let (function_code, data) = handler(&request);
            self.reply(&request, function_code, data).await?;
        }
        Ok(())
    }
}

pub struct Factory;

impl Factory {
    pub fn challenge_response(challenge: [u8; 16]) -> Vec<u8> {
        let mut data = vec![0x24, 0x10];
        data.extend_from_slice(&challenge);
        data
    }

    pub fn login_result(code: u8) -> Vec<u8> {
        vec![0x25, 0x24, 0x01, 0x20, code, 0x37]
    }

    pub fn register_bytes(bytes: &[u8]) -> Vec<u8> {
        let mut data = vec![bytes.len() as u8];
        data.extend_from_slice(bytes);
        data
    }

    pub fn device_info(objects: &[(u8, &[u8])]) -> Vec<u8> {
        let mut data = vec![0x0e, 0x03, 0x87, 0x00, 0x00, objects.len() as u8];
        for (id, bytes) in objects {
            data.push(*id);
            data.push(bytes.len() as u8);
            data.extend_from_slice(bytes);
        }
        data
    }

    /// Register contents of a running SUN2000, keyed by start address.
    pub fn registers() -> HashMap<u16, Vec<u8>> {
        let mut model = b"SUN2000-5KTL-M1".to_vec();
        model.resize(32, 0);
        let mut serial = b"HV2150012345".to_vec();
        serial.resize(22, 0);

        HashMap::from([
            (30000, model),
            (30015, serial),
            (32016, 3605u16.to_be_bytes().to_vec()),
            (32017, 512u16.to_be_bytes().to_vec()),
            (32064, 1840i32.to_be_bytes().to_vec()),
            (32066, 2398u16.to_be_bytes().to_vec()),
            (32080, 1795i32.to_be_bytes().to_vec()),
            (32082, (-12i32).to_be_bytes().to_vec()),
            (32085, 5001u16.to_be_bytes().to_vec()),
            (32087, 412i16.to_be_bytes().to_vec()),
            (32089, 0x0200u16.to_be_bytes().to_vec()),
            (32212, 1234567u32.to_be_bytes().to_vec()),
            (37113, (-250i32).to_be_bytes().to_vec()),
            (37118, 4999i16.to_be_bytes().to_vec()),
        ])
    }

    /// A device that accepts any login and answers reads from [`Factory::registers`],
    /// zero filling anything unknown.
    pub fn inverter() -> impl FnMut(&Adu) -> (u8, Vec<u8>) {
        let registers = Self::registers();

        move |request| match (request.function_code, request.data.first()) {
            (0x41, Some(0x24)) => (0x41, Self::challenge_response([0; 16])),
            (0x41, _) => (0x41, Self::login_result(0)),
            (0x2b, _) => (0x2b, Self::device_info(&[(1, &b"SUN2000-5KTL-M1"[..])])),
            (0x03, _) => {
                let address = u16::from_be_bytes([request.data[0], request.data[1]]);
                let quantity = u16::from_be_bytes([request.data[2], request.data[3]]);
                let mut bytes = registers.get(&address).cloned().unwrap_or_default();
                bytes.resize(quantity as usize * 2, 0);
                (0x03, Self::register_bytes(&bytes))
            }
            (fc, _) => (fc | 0x80, vec![0x01]),
        }
    }
}
