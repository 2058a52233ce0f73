//! Value encoding between the native little-endian images and the wire.
//!
//! Everything dispatches over the [`DataType`] tag; there are no stored
//! per-variable conversion callbacks.

use crate::registry::{DataType, Variable};
use byteorder::{ByteOrder, LittleEndian};
use rtkit::encoding::base64;
use std::fmt::Write;

#[derive(Debug, Eq, PartialEq)]
pub enum CodecError {
    /// Token could not be parsed as the target type.
    BadNumber(String),
    /// Token or byte count does not match the variable's shape.
    WrongLength { expected: usize, got: usize },
    /// Base64 blob did not decode.
    BadBlob,
}

/// Number of ASCII tokens one sample of a variable occupies. Complex
/// elements take two fields (real and imaginary part).
#[inline]
pub fn ascii_field_count(var: &Variable) -> usize {
    match var.data_type {
        DataType::ComplexF64 => var.elem_count() * 2,
        _ => var.elem_count(),
    }
}

/// Appends one sample (`bytes`, native little-endian) as space-separated
/// ASCII fields. Floats carry `precision` fractional digits.
pub fn format_ascii(var: &Variable, bytes: &[u8], precision: usize, out: &mut String) {
    debug_assert_eq!(bytes.len(), var.byte_len());

    let size = var.data_type.size();

    for (index, chunk) in bytes.chunks(size).enumerate() {
        if index > 0 {
            out.push(' ');
        }

        match var.data_type {
            DataType::U8 => write!(out, "{}", chunk[0]),
            DataType::I8 => write!(out, "{}", chunk[0] as i8),
            DataType::U16 => write!(out, "{}", LittleEndian::read_u16(chunk)),
            DataType::I16 => write!(out, "{}", LittleEndian::read_i16(chunk)),
            DataType::U32 => write!(out, "{}", LittleEndian::read_u32(chunk)),
            DataType::I32 => write!(out, "{}", LittleEndian::read_i32(chunk)),
            DataType::U64 => write!(out, "{}", LittleEndian::read_u64(chunk)),
            DataType::I64 => write!(out, "{}", LittleEndian::read_i64(chunk)),
            DataType::F32 => write!(out, "{:.*}", precision, LittleEndian::read_f32(chunk)),
            DataType::F64 => write!(out, "{:.*}", precision, LittleEndian::read_f64(chunk)),
            DataType::ComplexF64 => write!(
                out,
                "{:.*} {:.*}",
                precision,
                LittleEndian::read_f64(&chunk[..8]),
                precision,
                LittleEndian::read_f64(&chunk[8..])
            ),
        }
        .expect("formatting into a String cannot fail");
    }
}

/// Parses ASCII tokens into the native little-endian representation of one
/// sample of `var`.
pub fn parse_ascii(var: &Variable, tokens: &[&str]) -> Result<Vec<u8>, CodecError> {
    let expected = ascii_field_count(var);

    if tokens.len() != expected {
        return Err(CodecError::WrongLength {
            expected,
            got: tokens.len(),
        });
    }

    let mut bytes = Vec::with_capacity(var.byte_len());

    match var.data_type {
        DataType::ComplexF64 => {
            for pair in tokens.chunks(2) {
                for token in pair {
                    let value = parse_token::<f64>(token)?;
                    let mut buf = [0u8; 8];
                    LittleEndian::write_f64(&mut buf, value);
                    bytes.extend_from_slice(&buf);
                }
            }
        }
        data_type => {
            for token in tokens {
                append_scalar(data_type, token, &mut bytes)?;
            }
        }
    }

    Ok(bytes)
}

fn append_scalar(data_type: DataType, token: &str, bytes: &mut Vec<u8>) -> Result<(), CodecError> {
    match data_type {
        DataType::U8 => bytes.push(parse_token::<u8>(token)?),
        DataType::I8 => bytes.push(parse_token::<i8>(token)? as u8),
        DataType::U16 => {
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::I16 => {
            let mut buf = [0u8; 2];
            LittleEndian::write_i16(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::U32 => {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::I32 => {
            let mut buf = [0u8; 4];
            LittleEndian::write_i32(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::U64 => {
            let mut buf = [0u8; 8];
            LittleEndian::write_u64(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::I64 => {
            let mut buf = [0u8; 8];
            LittleEndian::write_i64(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::F32 => {
            let mut buf = [0u8; 4];
            LittleEndian::write_f32(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::F64 => {
            let mut buf = [0u8; 8];
            LittleEndian::write_f64(&mut buf, parse_token(token)?);
            bytes.extend_from_slice(&buf);
        }
        DataType::ComplexF64 => unreachable!("complex handled by the caller"),
    }

    Ok(())
}

#[inline]
fn parse_token<T: std::str::FromStr>(token: &str) -> Result<T, CodecError> {
    token
        .parse()
        .map_err(|_| CodecError::BadNumber(token.into()))
}

/// Encodes one or more raw samples as base64 over their native
/// little-endian bytes.
#[inline]
pub fn encode_raw(bytes: &[u8]) -> String {
    base64::encode(bytes)
}

/// Decodes a base64 blob into the raw representation of one sample,
/// enforcing the variable's byte length.
pub fn decode_raw(var: &Variable, blob: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = base64::decode(blob).map_err(|_| CodecError::BadBlob)?;

    if bytes.len() != var.byte_len() {
        return Err(CodecError::WrongLength {
            expected: var.byte_len(),
            got: bytes.len(),
        });
    }

    Ok(bytes)
}
