use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use super::Client;
use crate::error::Error;
use crate::modbus::registers::{self, RegisterValue};
use crate::modbus::FunctionCall;

/// How a field is laid out in holding registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WordType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// Character string packed into this many big-endian registers.
    Str(u16),
}

impl WordType {
    pub fn registers(&self) -> u16 {
        match self {
            WordType::I8 | WordType::U8 | WordType::I16 | WordType::U16 => 1,
            WordType::I32 | WordType::U32 => 2,
            WordType::I64 | WordType::U64 => 4,
            WordType::Str(n) => *n,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldId {
    ModelName,
    SerialNumber,
    Pv1VoltageV,
    Pv1CurrentA,
    Pv2VoltageV,
    Pv2CurrentA,
    Pv3VoltageV,
    Pv3CurrentA,
    InputPowerW,
    GridVoltageV,
    ActivePowerW,
    InverterActivePowerW,
    InverterReactivePowerW,
    GridFrequencyHz,
    InternalTemperatureC,
    DeviceStatus,
    Mppt1CumKwh,
    Mppt2CumKwh,
    Mppt3CumKwh,
    MeterGridAVoltageV,
    MeterGridBVoltageV,
    MeterGridCVoltageV,
    MeterActivePowerW,
    MeterReactivePowerW,
    MeterGridFrequencyHz,
    MeterActiveGridPowerW,
}

impl FieldId {
    pub fn name(&self) -> &'static str {
        match self {
            FieldId::ModelName => "model_name",
            FieldId::SerialNumber => "serial_number",
            FieldId::Pv1VoltageV => "pv1_voltage_v",
            FieldId::Pv1CurrentA => "pv1_current_a",
            FieldId::Pv2VoltageV => "pv2_voltage_v",
            FieldId::Pv2CurrentA => "pv2_current_a",
            FieldId::Pv3VoltageV => "pv3_voltage_v",
            FieldId::Pv3CurrentA => "pv3_current_a",
            FieldId::InputPowerW => "input_power_w",
            FieldId::GridVoltageV => "grid_voltage_v",
            FieldId::ActivePowerW => "active_power_w",
            FieldId::InverterActivePowerW => "inverter_active_power_w",
            FieldId::InverterReactivePowerW => "inverter_reactive_power_w",
            FieldId::GridFrequencyHz => "grid_frequency_hz",
            FieldId::InternalTemperatureC => "internal_temperature_c",
            FieldId::DeviceStatus => "device_status",
            FieldId::Mppt1CumKwh => "mppt1_cum_kwh",
            FieldId::Mppt2CumKwh => "mppt2_cum_kwh",
            FieldId::Mppt3CumKwh => "mppt3_cum_kwh",
            FieldId::MeterGridAVoltageV => "meter_grid_a_voltage_v",
            FieldId::MeterGridBVoltageV => "meter_grid_b_voltage_v",
            FieldId::MeterGridCVoltageV => "meter_grid_c_voltage_v",
            FieldId::MeterActivePowerW => "meter_active_power_w",
            FieldId::MeterReactivePowerW => "meter_reactive_power_w",
            FieldId::MeterGridFrequencyHz => "meter_grid_frequency_hz",
            FieldId::MeterActiveGridPowerW => "meter_active_grid_power_w",
        }
    }
}

/// Decode metadata for one telemetry field: `value = raw / scale`.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub id: FieldId,
    pub address: u16,
    pub word: WordType,
    pub scale: u32,
}

const fn field(id: FieldId, address: u16, word: WordType, scale: u32) -> Field {
    Field {
        id,
        address,
        word,
        scale,
    }
}

// {{{ TELEMETRY_SCHEMA
pub static TELEMETRY_SCHEMA: &[Field] = &[
    // identity
    field(FieldId::ModelName, 30000, WordType::Str(15), 1),
    field(FieldId::SerialNumber, 30015, WordType::Str(10), 1),
    // inverter
    field(FieldId::InputPowerW, 32064, WordType::I32, 1),
    field(FieldId::GridVoltageV, 32066, WordType::U16, 10),
    field(FieldId::ActivePowerW, 32080, WordType::I32, 1),
    field(FieldId::GridFrequencyHz, 32085, WordType::U16, 100),
    field(FieldId::InternalTemperatureC, 32087, WordType::I16, 10),
    field(FieldId::DeviceStatus, 32089, WordType::U16, 1),
    // cumulative energy per MPPT
    field(FieldId::Mppt1CumKwh, 32212, WordType::U32, 100),
    field(FieldId::Mppt2CumKwh, 32214, WordType::U32, 100),
    field(FieldId::Mppt3CumKwh, 32216, WordType::U32, 100),
    // pv strings
    field(FieldId::Pv1VoltageV, 32016, WordType::I16, 10),
    field(FieldId::Pv1CurrentA, 32017, WordType::I16, 100),
    field(FieldId::Pv2VoltageV, 32018, WordType::I16, 10),
    field(FieldId::Pv2CurrentA, 32019, WordType::I16, 100),
    field(FieldId::Pv3VoltageV, 32020, WordType::I16, 10),
    field(FieldId::Pv3CurrentA, 32021, WordType::I16, 100),
    // external meter
    field(FieldId::MeterGridAVoltageV, 37101, WordType::I32, 10),
    field(FieldId::MeterGridBVoltageV, 37103, WordType::I32, 10),
    field(FieldId::MeterGridCVoltageV, 37105, WordType::I32, 10),
    field(FieldId::MeterActivePowerW, 37113, WordType::I32, 1),
    field(FieldId::MeterReactivePowerW, 37115, WordType::I32, 1),
    field(FieldId::MeterActiveGridPowerW, 37132, WordType::I32, 1),
    field(FieldId::MeterGridFrequencyHz, 37118, WordType::I16, 100),
    // inverter power
    field(FieldId::InverterActivePowerW, 32080, WordType::I32, 1),
    field(FieldId::InverterReactivePowerW, 32082, WordType::I32, 1),
];
// }}}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub timestamp: DateTime<Utc>,

    pub model_name: String,
    pub serial_number: String,
    pub internal_temperature_c: f64,
    pub device_status: u16,
    pub device_status_text: String,

    // dc input vs inverted ac output
    pub input_power_w: f64,
    pub active_power_w: f64,

    pub grid_voltage_v: f64,
    pub grid_frequency_hz: f64,

    pub mppt1_cum_kwh: f64,
    pub mppt2_cum_kwh: f64,
    pub mppt3_cum_kwh: f64,

    pub pv1_voltage_v: f64,
    pub pv1_current_a: f64,
    pub pv2_voltage_v: f64,
    pub pv2_current_a: f64,
    pub pv3_voltage_v: f64,
    pub pv3_current_a: f64,

    // single phase installs only report phase A
    pub meter_grid_a_voltage_v: f64,
    pub meter_grid_b_voltage_v: f64,
    pub meter_grid_c_voltage_v: f64,
    pub meter_grid_frequency_hz: f64,

    pub meter_active_power_w: f64,
    pub meter_reactive_power_w: f64,
    pub meter_active_grid_power_w: f64,

    pub inverter_active_power_w: f64,
    pub inverter_reactive_power_w: f64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Stores a decoded value in the slot for `id`. A value of the wrong
    /// kind for the slot is ignored.
    pub fn set(&mut self, id: FieldId, value: Value) {
        let number = match value {
            Value::Text(text) => {
                match id {
                    FieldId::ModelName => self.model_name = text,
                    FieldId::SerialNumber => self.serial_number = text,
                    _ => warn!("text value for numeric field {}", id.name()),
                }
                return;
            }
            Value::Number(n) => n,
        };

        let slot = match id {
            FieldId::DeviceStatus => {
                self.device_status = number as u16;
                return;
            }
            FieldId::ModelName | FieldId::SerialNumber => {
                warn!("numeric value for text field {}", id.name());
                return;
            }
            FieldId::Pv1VoltageV => &mut self.pv1_voltage_v,
            FieldId::Pv1CurrentA => &mut self.pv1_current_a,
            FieldId::Pv2VoltageV => &mut self.pv2_voltage_v,
            FieldId::Pv2CurrentA => &mut self.pv2_current_a,
            FieldId::Pv3VoltageV => &mut self.pv3_voltage_v,
            FieldId::Pv3CurrentA => &mut self.pv3_current_a,
            FieldId::InputPowerW => &mut self.input_power_w,
            FieldId::GridVoltageV => &mut self.grid_voltage_v,
            FieldId::ActivePowerW => &mut self.active_power_w,
            FieldId::InverterActivePowerW => &mut self.inverter_active_power_w,
            FieldId::InverterReactivePowerW => &mut self.inverter_reactive_power_w,
            FieldId::GridFrequencyHz => &mut self.grid_frequency_hz,
            FieldId::InternalTemperatureC => &mut self.internal_temperature_c,
            FieldId::Mppt1CumKwh => &mut self.mppt1_cum_kwh,
            FieldId::Mppt2CumKwh => &mut self.mppt2_cum_kwh,
            FieldId::Mppt3CumKwh => &mut self.mppt3_cum_kwh,
            FieldId::MeterGridAVoltageV => &mut self.meter_grid_a_voltage_v,
            FieldId::MeterGridBVoltageV => &mut self.meter_grid_b_voltage_v,
            FieldId::MeterGridCVoltageV => &mut self.meter_grid_c_voltage_v,
            FieldId::MeterActivePowerW => &mut self.meter_active_power_w,
            FieldId::MeterReactivePowerW => &mut self.meter_reactive_power_w,
            FieldId::MeterGridFrequencyHz => &mut self.meter_grid_frequency_hz,
            FieldId::MeterActiveGridPowerW => &mut self.meter_active_grid_power_w,
        };
        *slot = number;
    }
}

/// Reads and decodes a single schema field.
pub async fn read_field<C>(conn: &C, field: &Field) -> Result<Value, Error>
where
    C: FunctionCall + ?Sized,
{
    let scale = f64::from(field.scale.max(1));

    let raw = match field.word {
        WordType::Str(n) => {
            return registers::read_holding_string(conn, field.address, n)
                .await
                .map(Value::Text)
        }
        WordType::I8 => read_raw::<i8, C>(conn, field.address).await?,
        WordType::U8 => read_raw::<u8, C>(conn, field.address).await?,
        WordType::I16 => read_raw::<i16, C>(conn, field.address).await?,
        WordType::U16 => read_raw::<u16, C>(conn, field.address).await?,
        WordType::I32 => read_raw::<i32, C>(conn, field.address).await?,
        WordType::U32 => read_raw::<u32, C>(conn, field.address).await?,
        WordType::I64 => read_raw::<i64, C>(conn, field.address).await?,
        WordType::U64 => read_raw::<u64, C>(conn, field.address).await?,
    };

    Ok(Value::Number(raw / scale))
}

async fn read_raw<T, C>(conn: &C, address: u16) -> Result<f64, Error>
where
    T: RegisterValue,
    C: FunctionCall + ?Sized,
{
    Ok(registers::read_holding_register::<T, C>(conn, address)
        .await?
        .to_f64())
}

/// Populates a record from `schema`, one read per field, stopping at the first failure.
pub async fn read_schema<C>(conn: &C, schema: &[Field]) -> Result<Telemetry, Error>
where
    C: FunctionCall + ?Sized,
{
    let mut telemetry = Telemetry::new();

    for field in schema {
        let value = read_field(conn, field).await.map_err(|err| {
            debug!(
                "read {} at {} failed: {}",
                field.id.name(),
                field.address,
                err
            );
            err
        })?;
        telemetry.set(field.id, value);
    }

    telemetry.device_status_text = status_text(telemetry.device_status).to_string();

    Ok(telemetry)
}

impl<C> Client<C>
where
    C: FunctionCall + ?Sized,
{
    /// Reads one complete telemetry record.
    pub async fn query(&self) -> Result<Telemetry, Error> {
        read_schema(self.connection().as_ref(), TELEMETRY_SCHEMA).await
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        0x0000 => "Standby, initializing",
        0x0001 => "Standby, detecting insulation resistance",
        0x0002 => "Standby, detecting irradiation",
        0x0003 => "Standby, grid detecting",
        0x0100 => "Starting",
        0x0200 => "On-grid",
        0x0201 => "Grid Connection, power limited",
        0x0202 => "Grid Connection, self-derating",
        0x0300 => "Shutdown, fault",
        0x0301 => "Shutdown, command",
        0x0302 => "Shutdown, OVGR",
        0x0303 => "Shutdown, communication disconnected",
        0x0304 => "Shutdown, power limited",
        0x0305 => "Shutdown, manual startup required",
        0x0306 => "Shutdown, DC switches disconnected",
        0x0307 => "Shutdown, rapid cutoff",
        0x0308 => "Shutdown, input underpowered",
        0x0401 => "Grid scheduling, cosphi-P curve",
        0x0402 => "Grid scheduling, Q-U curve",
        0x0403 => "Grid scheduling, PF-U curve",
        0x0404 => "Grid scheduling, dry contact",
        0x0405 => "Grid scheduling, Q-P curve",
        0x0500 => "Spot-check ready",
        0x0501 => "Spot-checking",
        0x0600 => "Inspecting",
        0x0700 => "AFCI self check",
        0x0800 => "I-V scanning",
        0x0900 => "DC input detection",
        0x0A00 => "Running, off-grid charging",
        0xA000 => "Standby, no irradiation",

        _ => "Unknown",
    }
}
