//! Codec-independent slice header measurement.

use vodpack_common::CodecId;

use crate::avc::AvcParser;
use crate::config::{parse_avcc, parse_hvcc};
use crate::error::{CodecError, Result};
use crate::hevc::HevcParser;
use crate::nal;

#[derive(Debug, Clone)]
enum Inner {
    Avc(AvcParser),
    Hevc(HevcParser),
}

/// Parameter-set state of one track, built from its decoder configuration
/// record.
///
/// Used by pattern encryption to leave slice headers in the clear.
#[derive(Debug, Clone)]
pub struct SliceParser {
    inner: Inner,
    nal_length_size: usize,
}

impl SliceParser {
    /// Load every parameter set of `extra_data` (`avcC` or `hvcC`)
    pub fn from_extra_data(codec: CodecId, extra_data: &[u8]) -> Result<Self> {
        match codec {
            CodecId::Avc => {
                let config = parse_avcc(extra_data)?;
                let mut parser = AvcParser::new();
                for unit in &config.units {
                    parser.parse_parameter_set(unit)?;
                }
                Ok(Self {
                    inner: Inner::Avc(parser),
                    nal_length_size: config.nal_length_size,
                })
            }
            CodecId::Hevc => {
                let config = parse_hvcc(extra_data)?;
                let mut parser = HevcParser::new();
                for unit in &config.units {
                    parser.parse_parameter_set(unit)?;
                }
                Ok(Self {
                    inner: Inner::Hevc(parser),
                    nal_length_size: config.nal_length_size,
                })
            }
            other => Err(CodecError::unsupported(format!("no slice parser for {other}"))),
        }
    }

    pub fn codec(&self) -> CodecId {
        match self.inner {
            Inner::Avc(_) => CodecId::Avc,
            Inner::Hevc(_) => CodecId::Hevc,
        }
    }

    /// Width of the length prefix in front of every NAL unit
    pub fn nal_length_size(&self) -> usize {
        self.nal_length_size
    }

    /// Smallest packet holding a length prefix and a complete NAL header
    pub fn min_packet_size(&self) -> usize {
        self.nal_length_size + self.nal_header_size()
    }

    pub fn nal_header_size(&self) -> usize {
        match self.inner {
            Inner::Avc(_) => nal::avc::HEADER_SIZE,
            Inner::Hevc(_) => nal::hevc::HEADER_SIZE,
        }
    }

    /// Whether the unit starting with `header` is a coded slice
    pub fn is_slice(&self, header: u8) -> Result<bool> {
        match self.inner {
            Inner::Avc(_) => AvcParser::is_slice(header),
            Inner::Hevc(_) => Ok(HevcParser::is_slice(header)),
        }
    }

    /// Slice header size of `nal_unit`, NAL header included.
    ///
    /// `nal_unit` may be a prefix of the unit as long as it covers the whole
    /// header.
    pub fn slice_header_size(&self, nal_unit: &[u8]) -> Result<usize> {
        match &self.inner {
            Inner::Avc(parser) => parser.slice_header_size(nal_unit),
            Inner::Hevc(parser) => parser.slice_header_size(nal_unit),
        }
    }

    /// Transfer characteristics from the VUI, 0 when absent
    pub fn transfer_characteristics(&self) -> u8 {
        match &self.inner {
            Inner::Avc(parser) => parser.transfer_characteristics(),
            Inner::Hevc(parser) => parser.transfer_characteristics(),
        }
    }
}
