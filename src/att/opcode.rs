//! Attribute Protocol opcodes and error codes.

use std::fmt;

/// Opcode bit set on PDUs that take no response.
pub const COMMAND_FLAG: u8 = 0x40;

/// Every ATT PDU opcode understood by the codec.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum Opcode {
   ErrorResponse = 0x01,
   ExchangeMtuRequest = 0x02,
   ExchangeMtuResponse = 0x03,
   FindInformationRequest = 0x04,
   FindInformationResponse = 0x05,
   FindByTypeValueRequest = 0x06,
   FindByTypeValueResponse = 0x07,
   ReadByTypeRequest = 0x08,
   ReadByTypeResponse = 0x09,
   ReadRequest = 0x0A,
   ReadResponse = 0x0B,
   ReadBlobRequest = 0x0C,
   ReadBlobResponse = 0x0D,
   ReadMultipleRequest = 0x0E,
   ReadMultipleResponse = 0x0F,
   ReadByGroupTypeRequest = 0x10,
   ReadByGroupTypeResponse = 0x11,
   WriteRequest = 0x12,
   WriteResponse = 0x13,
   PrepareWriteRequest = 0x16,
   PrepareWriteResponse = 0x17,
   ExecuteWriteRequest = 0x18,
   ExecuteWriteResponse = 0x19,
   HandleValueNotification = 0x1B,
   HandleValueIndication = 0x1D,
   HandleValueConfirmation = 0x1E,
   WriteCommand = 0x52,
}

impl Opcode {
   pub const fn id(self) -> u8 {
      self as u8
   }

   /// Opcode of the response a server sends for this request.
   ///
   /// `None` for commands, responses and server-initiated PDUs.
   pub const fn response(self) -> Option<Self> {
      match self {
         Self::ExchangeMtuRequest => Some(Self::ExchangeMtuResponse),
         Self::FindInformationRequest => Some(Self::FindInformationResponse),
         Self::FindByTypeValueRequest => Some(Self::FindByTypeValueResponse),
         Self::ReadByTypeRequest => Some(Self::ReadByTypeResponse),
         Self::ReadRequest => Some(Self::ReadResponse),
         Self::ReadBlobRequest => Some(Self::ReadBlobResponse),
         Self::ReadMultipleRequest => Some(Self::ReadMultipleResponse),
         Self::ReadByGroupTypeRequest => Some(Self::ReadByGroupTypeResponse),
         Self::WriteRequest => Some(Self::WriteResponse),
         Self::PrepareWriteRequest => Some(Self::PrepareWriteResponse),
         Self::ExecuteWriteRequest => Some(Self::ExecuteWriteResponse),
         _ => None,
      }
   }

   /// Whether a client sends this PDU.
   pub const fn is_client_pdu(self) -> bool {
      self.response().is_some()
         || matches!(self, Self::WriteCommand | Self::HandleValueConfirmation)
   }
}

/// ATT error codes carried by an Error Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttErrorCode {
   InvalidHandle,
   ReadNotPermitted,
   WriteNotPermitted,
   InvalidPdu,
   InsufficientAuthentication,
   RequestNotSupported,
   InvalidOffset,
   InsufficientAuthorization,
   PrepareQueueFull,
   AttributeNotFound,
   AttributeNotLong,
   InsufficientEncryptionKeySize,
   InvalidAttributeValueLength,
   UnlikelyError,
   InsufficientEncryption,
   UnsupportedGroupType,
   InsufficientResources,
   /// 0x80..=0x9F, defined by the application.
   Application(u8),
   /// 0xE0..=0xFF, defined by the Core Specification Supplement.
   CommonProfile(u8),
   /// Anything else, including the invalid value 0x00.
   Reserved(u8),
}

impl AttErrorCode {
   pub const fn from_raw(raw: u8) -> Self {
      match raw {
         0x01 => Self::InvalidHandle,
         0x02 => Self::ReadNotPermitted,
         0x03 => Self::WriteNotPermitted,
         0x04 => Self::InvalidPdu,
         0x05 => Self::InsufficientAuthentication,
         0x06 => Self::RequestNotSupported,
         0x07 => Self::InvalidOffset,
         0x08 => Self::InsufficientAuthorization,
         0x09 => Self::PrepareQueueFull,
         0x0A => Self::AttributeNotFound,
         0x0B => Self::AttributeNotLong,
         0x0C => Self::InsufficientEncryptionKeySize,
         0x0D => Self::InvalidAttributeValueLength,
         0x0E => Self::UnlikelyError,
         0x0F => Self::InsufficientEncryption,
         0x10 => Self::UnsupportedGroupType,
         0x11 => Self::InsufficientResources,
         0x80..=0x9F => Self::Application(raw),
         0xE0..=0xFF => Self::CommonProfile(raw),
         _ => Self::Reserved(raw),
      }
   }

   pub const fn raw(self) -> u8 {
      match self {
         Self::InvalidHandle => 0x01,
         Self::ReadNotPermitted => 0x02,
         Self::WriteNotPermitted => 0x03,
         Self::InvalidPdu => 0x04,
         Self::InsufficientAuthentication => 0x05,
         Self::RequestNotSupported => 0x06,
         Self::InvalidOffset => 0x07,
         Self::InsufficientAuthorization => 0x08,
         Self::PrepareQueueFull => 0x09,
         Self::AttributeNotFound => 0x0A,
         Self::AttributeNotLong => 0x0B,
         Self::InsufficientEncryptionKeySize => 0x0C,
         Self::InvalidAttributeValueLength => 0x0D,
         Self::UnlikelyError => 0x0E,
         Self::InsufficientEncryption => 0x0F,
         Self::UnsupportedGroupType => 0x10,
         Self::InsufficientResources => 0x11,
         Self::Application(raw) | Self::CommonProfile(raw) | Self::Reserved(raw) => raw,
      }
   }
}

impl fmt::Display for AttErrorCode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Application(raw) => write!(f, "application error 0x{raw:02x}"),
         Self::CommonProfile(raw) => write!(f, "common profile error 0x{raw:02x}"),
         Self::Reserved(raw) => write!(f, "reserved error 0x{raw:02x}"),
         other => fmt::Debug::fmt(other, f),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_request_response_pairs() {
      assert_eq!(
         Opcode::ReadRequest.response(),
         Some(Opcode::ReadResponse)
      );
      assert_eq!(
         Opcode::ReadByGroupTypeRequest.response(),
         Some(Opcode::ReadByGroupTypeResponse)
      );
      assert_eq!(Opcode::WriteCommand.response(), None);
      assert!(Opcode::WriteCommand.is_client_pdu());
      assert!(!Opcode::HandleValueNotification.is_client_pdu());
   }

   #[test]
   fn test_error_code_ranges() {
      for raw in 0..=0xffu8 {
         assert_eq!(AttErrorCode::from_raw(raw).raw(), raw);
      }
      assert_eq!(
         AttErrorCode::from_raw(0x0A),
         AttErrorCode::AttributeNotFound
      );
      assert_eq!(AttErrorCode::from_raw(0x85), AttErrorCode::Application(0x85));
      assert_eq!(
         AttErrorCode::from_raw(0xFD),
         AttErrorCode::CommonProfile(0xFD)
      );
      assert_eq!(AttErrorCode::from_raw(0x00), AttErrorCode::Reserved(0x00));
   }
}
