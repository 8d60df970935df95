use std::collections::BTreeMap;

use log::{debug, info, warn};
use nom::multi::length_data;
use nom::number::complete::be_u8;
use nom::IResult;
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::Client;
use crate::error::Error;
use crate::modbus::FunctionCall;

pub const DEVICE_INFO_FUNCTION: u8 = 0x2B;

const DEVICE_INFO_REQUEST: [u8; 3] = [0x0E, 0x03, 0x87];

const MIN_RESPONSE_LEN: usize = 5;
const SUMMARY_LEN: usize = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ObjectKind {
    Model = 1,
    SoftwareVersion = 2,
    ProtocolVersion = 3,
    SerialNumber = 4,
    // 0 is the device the modbus card is plugged into
    DeviceId = 5,
    FeatureVersion = 6,
    DeviceType = 8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Nom)]
pub struct Summary {
    pub mei_type: u8,
    pub device_id_code: u8,
    pub consistency_level: u8,
    pub more: u8,
    pub next_object_id: u8,
    pub object_count: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfoObject {
    pub id: u16,
    pub data: Vec<u8>,
    /// `key=value` pairs separated by `;`, only filled when the data has an `=`.
    pub properties: BTreeMap<String, String>,
}

impl DeviceInfoObject {
    pub fn new(id: u16, data: Vec<u8>) -> Self {
        let properties = parse_properties(&data);
        Self {
            id,
            data,
            properties,
        }
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        ObjectKind::try_from(self.id).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    pub summary: Summary,
    pub objects: Vec<DeviceInfoObject>,
}

impl DeviceInfo {
    pub fn get(&self, kind: ObjectKind) -> Option<&DeviceInfoObject> {
        self.objects.iter().find(|o| o.kind() == Some(kind))
    }
}

fn object(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (input, id) = be_u8(input)?;
    let (input, data) = length_data(be_u8)(input)?;
    Ok((input, (id, data)))
}

fn parse_properties(data: &[u8]) -> BTreeMap<String, String> {
    if !data.contains(&b'=') {
        return BTreeMap::new();
    }

    String::from_utf8_lossy(data)
        .split(';')
        .filter(|prop| !prop.is_empty())
        .map(|prop| match prop.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (prop.to_string(), String::new()),
        })
        .collect()
}

/// Decodes a device info response payload.
///
/// Objects are `(id, length, data)` triples following the 6 byte summary.
/// An object whose length runs past the end of the buffer ends the parse;
/// everything before it is kept.
pub fn parse_device_info(data: &[u8]) -> Result<DeviceInfo, Error> {
    if data.len() < MIN_RESPONSE_LEN {
        return Err(Error::ShortResponse {
            expected: MIN_RESPONSE_LEN,
            actual: data.len(),
        });
    }

    // a 5 byte response stops short of the object count
    let mut header = [0u8; SUMMARY_LEN];
    let n = data.len().min(SUMMARY_LEN);
    header[..n].copy_from_slice(&data[..n]);
    let (_, summary) = Summary::parse(&header[..]).map_err(|_| Error::ShortResponse {
        expected: SUMMARY_LEN,
        actual: data.len(),
    })?;

    let mut objects = Vec::new();
    let mut cursor = data.get(SUMMARY_LEN..).unwrap_or_default();

    while cursor.len() >= 2 {
        let (rest, (id, bytes)) = match object(cursor) {
            Ok(r) => r,
            Err(_) => {
                warn!(
                    "device info object {} claims {} bytes, {} left",
                    cursor[0],
                    cursor[1],
                    cursor.len() - 2
                );
                break;
            }
        };

        objects.push(DeviceInfoObject::new(u16::from(id), bytes.to_vec()));
        cursor = rest;
    }

    debug!(
        "device info summary={:?} parsed {} objects",
        summary,
        objects.len()
    );

    Ok(DeviceInfo { summary, objects })
}

impl<C> Client<C>
where
    C: FunctionCall + ?Sized,
{
    /// Queries the vendor device info objects.
    pub async fn device_info(&self) -> Result<DeviceInfo, Error> {
        let response = self
            .connection()
            .function_call(DEVICE_INFO_FUNCTION, DEVICE_INFO_REQUEST.to_vec())
            .await?
            .check_exception()?;

        let info = parse_device_info(&response.data)?;
        for object in &info.objects {
            info!(
                "device info id={} kind={:?} data={:?} props={:?}",
                object.id,
                object.kind(),
                object.text(),
                object.properties
            );
        }

        Ok(info)
    }
}
