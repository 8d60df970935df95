use log::debug;

use super::connection::FunctionCall;
use crate::error::Error;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Protocol ceiling for a single read holding registers request.
pub const MAX_REGISTERS: u16 = 125;

/// A fixed-width big-endian value that can be read out of holding registers.
pub trait RegisterValue: Sized + Copy {
    const WIDTH: usize;

    fn from_be_slice(bytes: &[u8]) -> Self;

    fn to_f64(self) -> f64;
}

macro_rules! register_value {
    ($($t:ty),*) => {
        $(
            impl RegisterValue for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                fn from_be_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$t>::from_be_bytes(raw)
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

register_value!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Reads `quantity` 16-bit registers starting at `address` and returns their raw bytes.
///
/// Quantities outside 1..=125 are refused before anything is sent.
pub async fn read_holding_registers<C>(
    conn: &C,
    address: u16,
    quantity: u16,
) -> Result<Vec<u8>, Error>
where
    C: FunctionCall + ?Sized,
{
    if !(1..=MAX_REGISTERS).contains(&quantity) {
        return Err(Error::InvalidQuantity(quantity));
    }

    let mut request = Vec::with_capacity(4);
    request.extend_from_slice(&address.to_be_bytes());
    request.extend_from_slice(&quantity.to_be_bytes());

    let response = conn
        .function_call(READ_HOLDING_REGISTERS, request)
        .await?
        .check_exception()?;

    let (&count, values) = response.data.split_first().ok_or(Error::EmptyResponse)?;

    let expected = quantity as usize * 2;
    if count as usize != expected {
        return Err(Error::ByteCountMismatch {
            expected,
            actual: count as usize,
        });
    }
    if values.len() != expected {
        return Err(Error::ByteCountMismatch {
            expected,
            actual: values.len(),
        });
    }

    Ok(values.to_vec())
}

/// Reads `count` consecutive values of type `T`, sized to the fewest registers covering them.
pub async fn read_holding_values<T, C>(conn: &C, address: u16, count: u16) -> Result<Vec<T>, Error>
where
    T: RegisterValue,
    C: FunctionCall + ?Sized,
{
    let registers = (count as usize * T::WIDTH).div_ceil(2);
    if registers > MAX_REGISTERS as usize {
        return Err(Error::InvalidQuantity(
            u16::try_from(registers).unwrap_or(u16::MAX),
        ));
    }

    debug!(
        "querying holding registers address={} count={} registers={}",
        address, count, registers
    );
    let bytes = read_holding_registers(conn, address, registers as u16).await?;

    Ok(bytes
        .chunks_exact(T::WIDTH)
        .take(count as usize)
        .map(T::from_be_slice)
        .collect())
}

pub async fn read_holding_register<T, C>(conn: &C, address: u16) -> Result<T, Error>
where
    T: RegisterValue,
    C: FunctionCall + ?Sized,
{
    read_holding_values::<T, C>(conn, address, 1)
        .await?
        .into_iter()
        .next()
        .ok_or(Error::EmptyResponse)
}

/// Reads a string packed into `registers` big-endian words.
///
/// One extra register is read past the string and discarded; trailing NULs
/// are stripped.
pub async fn read_holding_string<C>(conn: &C, address: u16, registers: u16) -> Result<String, Error>
where
    C: FunctionCall + ?Sized,
{
    let bytes = read_holding_registers(conn, address, registers.saturating_add(1)).await?;

    Ok(decode_string(&bytes[..registers as usize * 2]))
}

pub fn decode_string(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modbus::Adu;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers calls from a queue of canned responses and records every request.
    #[derive(Default)]
    pub(crate) struct Scripted {
        pub responses: Mutex<VecDeque<(u8, Vec<u8>)>>,
        pub requests: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl Scripted {
        pub fn new(responses: Vec<(u8, Vec<u8>)>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<(u8, Vec<u8>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FunctionCall for Scripted {
        async fn function_call(&self, function_code: u8, data: Vec<u8>) -> Result<Adu, Error> {
            self.requests.lock().unwrap().push((function_code, data));
            let (fc, data) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(Error::ConnectionClosed)?;
            Ok(Adu::new(1, 1, fc, data))
        }
    }

    #[tokio::test]
    async fn reads_scaled_temperature() {
        let conn = Scripted::new(vec![(0x03, vec![0x02, 0x00, 0x64])]);

        let raw: i16 = read_holding_register(&conn, 32087).await.unwrap();

        assert_eq!(raw, 100);
        assert_eq!(raw.to_f64() / 10.0, 10.0);
        assert_eq!(conn.requests(), vec![(0x03, vec![0x7d, 0x57, 0x00, 0x01])]);
    }

    #[tokio::test]
    async fn refuses_oversized_quantity_without_sending() {
        let conn = Scripted::default();

        let result = read_holding_registers(&conn, 0, 200).await;

        assert!(matches!(result, Err(Error::InvalidQuantity(200))));
        assert!(conn.requests().is_empty());
    }

    #[tokio::test]
    async fn refuses_zero_quantity() {
        let conn = Scripted::default();

        assert!(matches!(
            read_holding_registers(&conn, 0, 0).await,
            Err(Error::InvalidQuantity(0))
        ));
    }

    #[tokio::test]
    async fn byte_count_must_match_request() {
        let conn = Scripted::new(vec![(0x03, vec![0x04, 0, 1, 0, 2])]);

        let result = read_holding_registers(&conn, 100, 1).await;

        assert!(matches!(
            result,
            Err(Error::ByteCountMismatch {
                expected: 2,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn payload_must_match_byte_count() {
        let conn = Scripted::new(vec![(0x03, vec![0x02, 0])]);

        assert!(matches!(
            read_holding_registers(&conn, 100, 1).await,
            Err(Error::ByteCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn empty_response_is_an_error() {
        let conn = Scripted::new(vec![(0x03, vec![])]);

        assert!(matches!(
            read_holding_registers(&conn, 100, 1).await,
            Err(Error::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn exception_response_is_surfaced() {
        let conn = Scripted::new(vec![(0x83, vec![0x02])]);

        assert!(matches!(
            read_holding_registers(&conn, 100, 1).await,
            Err(Error::Exception {
                function: 0x03,
                code: 0x02
            })
        ));
    }

    #[tokio::test]
    async fn reads_signed_32_bit_over_two_registers() {
        let conn = Scripted::new(vec![(0x03, vec![0x04, 0xff, 0xff, 0xfc, 0x18])]);

        let value: i32 = read_holding_register(&conn, 32080).await.unwrap();

        assert_eq!(value, -1000);
        assert_eq!(conn.requests()[0].1, vec![0x7d, 0x50, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn reads_8_bit_value_from_one_register() {
        let conn = Scripted::new(vec![(0x03, vec![0x02, 0x2a, 0x00])]);

        let value: u8 = read_holding_register(&conn, 1).await.unwrap();

        assert_eq!(value, 42);
        assert_eq!(conn.requests()[0].1, vec![0x00, 0x01, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn refuses_values_spanning_too_many_registers() {
        let conn = Scripted::default();

        let result = read_holding_values::<u64, _>(&conn, 0, 32).await;

        assert!(matches!(result, Err(Error::InvalidQuantity(128))));
        assert!(conn.requests().is_empty());
    }

    #[tokio::test]
    async fn reads_string_with_trailing_nuls() {
        let mut data = vec![0x08];
        data.extend_from_slice(b"SUN\0\0\0");
        data.extend_from_slice(&[0xaa, 0xbb]);
        let conn = Scripted::new(vec![(0x03, data)]);

        let s = read_holding_string(&conn, 30000, 3).await.unwrap();

        assert_eq!(s, "SUN");
        assert_eq!(conn.requests()[0].1, vec![0x75, 0x30, 0x00, 0x04]);
    }

    #[test]
    fn decode_string_strips_only_trailing_nuls() {
        assert_eq!(decode_string(b"A\0B\0\0"), "A\0B");
        assert_eq!(decode_string(b"\0\0"), "");
        assert_eq!(decode_string(b"SUN2000"), "SUN2000");
    }
}
