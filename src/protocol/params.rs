//! Extended parameter protocol (PARAM_EXT_*) payload encoding.
//!
//! Values travel as raw little-endian bytes in a 128 byte field, tagged
//! with their type. Parameter ids are at most 16 bytes, NUL padded.

use thiserror::Error;

use super::mav::{
    MavMessage, MavParamExtType, PARAM_EXT_REQUEST_LIST_DATA, PARAM_EXT_REQUEST_READ_DATA,
    PARAM_EXT_SET_DATA,
};
use super::Identity;

pub const PARAM_ID_LEN: usize = 16;
pub const PARAM_VALUE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("parameter id '{0}' is longer than 16 bytes")]
    IdTooLong(String),

    #[error("parameter type {0:?} is not supported")]
    UnsupportedType(MavParamExtType),

    #[error("parameter value has {got} bytes, type needs {needed}")]
    ShortValue { got: usize, needed: usize },
}

/// A typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ParamValue {
    pub fn param_type(&self) -> MavParamExtType {
        match self {
            Self::U8(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_UINT8,
            Self::I8(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_INT8,
            Self::U16(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_UINT16,
            Self::I16(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_INT16,
            Self::U32(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_UINT32,
            Self::I32(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_INT32,
            Self::U64(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_UINT64,
            Self::I64(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_INT64,
            Self::F32(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_REAL32,
            Self::F64(_) => MavParamExtType::MAV_PARAM_EXT_TYPE_REAL64,
        }
    }

    pub fn encode(&self) -> [u8; PARAM_VALUE_LEN] {
        let mut out = [0u8; PARAM_VALUE_LEN];
        let bytes: Vec<u8> = match *self {
            Self::U8(v) => v.to_le_bytes().to_vec(),
            Self::I8(v) => v.to_le_bytes().to_vec(),
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::I64(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
        };
        out[..bytes.len()].copy_from_slice(&bytes);
        out
    }

    pub fn decode(param_type: MavParamExtType, bytes: &[u8]) -> Result<Self, ParamError> {
        fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ParamError> {
            bytes
                .get(..N)
                .and_then(|s| <[u8; N]>::try_from(s).ok())
                .ok_or(ParamError::ShortValue {
                    got: bytes.len(),
                    needed: N,
                })
        }

        use MavParamExtType as T;
        Ok(match param_type {
            T::MAV_PARAM_EXT_TYPE_UINT8 => Self::U8(u8::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_INT8 => Self::I8(i8::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_UINT16 => Self::U16(u16::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_INT16 => Self::I16(i16::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_UINT32 => Self::U32(u32::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_INT32 => Self::I32(i32::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_UINT64 => Self::U64(u64::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_INT64 => Self::I64(i64::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_REAL32 => Self::F32(f32::from_le_bytes(take(bytes)?)),
            T::MAV_PARAM_EXT_TYPE_REAL64 => Self::F64(f64::from_le_bytes(take(bytes)?)),
            other => return Err(ParamError::UnsupportedType(other)),
        })
    }
}

/// Parameter addressed by name or by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    Id(String),
    Index(u16),
}

pub fn encode_param_id(id: &str) -> Result<[u8; PARAM_ID_LEN], ParamError> {
    let raw = id.as_bytes();
    if raw.len() > PARAM_ID_LEN {
        return Err(ParamError::IdTooLong(id.to_string()));
    }
    let mut out = [0u8; PARAM_ID_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Ok(out)
}

pub fn decode_param_id(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub fn param_ext_request_list(target: Identity) -> MavMessage {
    MavMessage::PARAM_EXT_REQUEST_LIST(PARAM_EXT_REQUEST_LIST_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
    })
}

pub fn param_ext_request_read(target: Identity, param: &ParamRef) -> Result<MavMessage, ParamError> {
    let (param_id, param_index) = match param {
        ParamRef::Id(id) => (encode_param_id(id)?, -1),
        ParamRef::Index(index) => ([0u8; PARAM_ID_LEN], i16::try_from(*index).unwrap_or(i16::MAX)),
    };
    Ok(MavMessage::PARAM_EXT_REQUEST_READ(PARAM_EXT_REQUEST_READ_DATA {
        param_index,
        target_system: target.system_id,
        target_component: target.component_id,
        param_id,
    }))
}

pub fn param_ext_set(target: Identity, id: &str, value: ParamValue) -> Result<MavMessage, ParamError> {
    Ok(MavMessage::PARAM_EXT_SET(PARAM_EXT_SET_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
        param_id: encode_param_id(id)?,
        param_value: value.encode(),
        param_type: value.param_type(),
    }))
}
