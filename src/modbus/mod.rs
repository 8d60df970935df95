pub mod adu;
pub mod connection;
pub mod registers;

pub use adu::{Adu, AduCodec, Header};
pub use connection::{Connection, FunctionCall};
pub use registers::{
    read_holding_register, read_holding_registers, read_holding_string, read_holding_values,
    RegisterValue,
};
