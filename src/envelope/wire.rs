//! Protobuf wire helpers shared by the envelope messages
//!
//! Messages are read and written field by field with `protobuf`'s coded
//! streams, the way generated code does it: a loop over raw tags where known
//! `(field_number << 3) | wire_type` tags are decoded and everything else is
//! skipped so newer recordings stay readable. Signed fields use the ZigZag
//! (`sint32`) encoding.

use protobuf::{CodedInputStream, CodedOutputStream, UnknownFields};

use crate::{ReplayError, Result};

pub const WIRE_VARINT: u32 = 0;
pub const WIRE_LENGTH_DELIMITED: u32 = 2;

/// Raw tag for `field` with the given wire type.
pub const fn tag(field: u32, wire_type: u32) -> u32 {
    (field << 3) | wire_type
}

/// Map a `protobuf` error into a parse error for `context`.
pub fn parse_error(context: &str, error: protobuf::Error) -> ReplayError {
    ReplayError::parse(context, error.to_string())
}

/// Encode one message into a fresh buffer.
pub fn encode_message<F>(context: &str, write: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut CodedOutputStream<'_>) -> protobuf::Result<()>,
{
    let mut buf = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut buf);
        write(&mut os).map_err(|e| parse_error(context, e))?;
        os.flush().map_err(|e| parse_error(context, e))?;
    }
    Ok(buf)
}

/// Decode one message, calling `field` for every tag.
///
/// `field` returns `Ok(false)` for tags it does not know; those are skipped.
pub fn decode_message<F>(data: &[u8], context: &str, mut field: F) -> Result<()>
where
    F: FnMut(u32, &mut CodedInputStream<'_>) -> protobuf::Result<bool>,
{
    let mut is = CodedInputStream::from_bytes(data);
    let mut unknown = UnknownFields::new();
    let mut decode = || -> protobuf::Result<()> {
        while let Some(tag) = is.read_raw_tag_or_eof()? {
            if !field(tag, &mut is)? {
                protobuf::rt::read_unknown_or_skip_group(tag, &mut is, &mut unknown)?;
            }
        }
        Ok(())
    };
    decode().map_err(|e| parse_error(context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<u8> {
        encode_message("test", |os| {
            os.write_uint32(1, 300)?;
            os.write_string(7, "ignored")?;
            os.write_sint32(2, -5)
        })
        .unwrap()
    }

    proptest! {
      #[test]
      fn decoder_never_panics_on_arbitrary_input(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_message(&data, "fuzz", |_, _| Ok(false));
      }
    }

    #[test]
    fn small_signed_values_use_zigzag() {
        let data = encode_message("test", |os| os.write_sint32(1, -1)).unwrap();
        assert_eq!(data, vec![tag(1, WIRE_VARINT) as u8, 0x01]);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let data = sample();
        let mut seen = Vec::new();
        decode_message(&data, "test", |tag_value, is| match tag_value {
            t if t == tag(1, WIRE_VARINT) => {
                seen.push(is.read_uint32()? as i64);
                Ok(true)
            }
            t if t == tag(2, WIRE_VARINT) => {
                seen.push(is.read_sint32()? as i64);
                Ok(true)
            }
            _ => Ok(false),
        })
        .unwrap();
        assert_eq!(seen, vec![300, -5]);
    }

    #[test]
    fn truncated_length_is_rejected() {
        // field 2, length-delimited, claims 10 bytes but only 2 follow
        let data = [0x12, 0x0A, 0x01, 0x02];
        let err = decode_message(&data, "test", |_, _| Ok(false)).unwrap_err();
        assert!(matches!(err, ReplayError::Parse { .. }));
    }

    #[test]
    fn field_reader_errors_carry_context() {
        // field 1 declared as length-delimited, truncated
        let data = [0x0A, 0xFF, 0xFF];
        let err = decode_message(&data, "ImageReading", |tag_value, is| {
            if tag_value == tag(1, WIRE_LENGTH_DELIMITED) {
                is.read_string()?;
                return Ok(true);
            }
            Ok(false)
        })
        .unwrap_err();
        assert!(err.to_string().contains("ImageReading"));
    }
}
