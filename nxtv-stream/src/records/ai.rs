//! Application Information block.

use nxtv_ttx::packet::Cni;

use crate::alphabet::decode_string;
use crate::block::RawBlock;
use crate::error::BlockError;

use super::{Cursor, MAX_NETWOPS};

/// One network of the provider's netwop table.
#[derive(Debug, Clone, PartialEq)]
pub struct AiNetwop {
    pub cni: Cni,
    /// First PI block number of stream 1.
    pub start_no: u16,
    /// Last PI block number of stream 1.
    pub stop_no: u16,
    /// Last PI block number including stream 2 ("schedule without
    /// overrun").
    pub stop_no_swo: u16,
    /// Local time offset, signed, in units of 15 minutes.
    pub lto: i8,
    /// Days of schedule coverage.
    pub day_count: u8,
    /// G0 alphabet index for this network's strings.
    pub alphabet: u8,
    pub add_info: u16,
    pub name: Box<str>,
}

/// Application Information: provider identity, version counters and
/// the network table every other record refers into. At most one per
/// database.
#[derive(Debug, Clone, PartialEq)]
pub struct Ai {
    /// Version counter of stream 1.
    pub version: u8,
    /// Version counter of stream 2.
    pub version_swo: u8,
    /// Index of the providing network in the netwop table.
    pub this_netwop: u8,
    pub ni_count: u8,
    pub ni_count_swo: u8,
    pub oi_count: u8,
    pub oi_count_swo: u8,
    pub mi_count: u8,
    pub mi_count_swo: u8,
    pub service_name: Box<str>,
    pub netwops: Vec<AiNetwop>,
}

impl Ai {
    pub fn netwop_count(&self) -> u8 {
        self.netwops.len() as u8
    }

    /// CNI of the providing network, 0 if the table is inconsistent.
    pub fn cni(&self) -> Cni {
        self.netwops
            .get(self.this_netwop as usize)
            .map(|n| n.cni)
            .unwrap_or(Cni(0))
    }

    pub fn netwop(&self, idx: u8) -> Option<&AiNetwop> {
        self.netwops.get(idx as usize)
    }
}

pub(super) fn decode_ai(block: &RawBlock) -> Result<Ai, BlockError> {
    let mut cur = Cursor::new(block.ctrl(), block.text());
    cur.skip(5)?;

    // version counters straddle the byte boundary (stream 1: byte 5
    // bits 4..7 + byte 6 bits 0..1, stream 2: byte 6 bits 2..7)
    let b5 = cur.u8()?;
    let b6 = cur.u8()?;
    let version = (b5 >> 4) | ((b6 & 0x03) << 4);
    let version_swo = b6 >> 2;
    let netwop_count = cur.u8()?;
    let this_netwop = cur.u8()?;
    let ni_count = cur.u8()?;
    let ni_count_swo = cur.u8()?;
    let oi_count = cur.u8()?;
    let oi_count_swo = cur.u8()?;
    let mi_count = cur.u8()?;
    let mi_count_swo = cur.u8()?;
    let service_name_len = cur.u8()? as usize;

    if netwop_count as usize > MAX_NETWOPS {
        return Err(BlockError::NetwopRange(netwop_count));
    }

    struct RawNetwop {
        cni: u16,
        start_no: u16,
        stop_no: u16,
        stop_no_swo: u16,
        lto: i8,
        day_count: u8,
        alphabet: u8,
        name_len: u8,
        add_info: u16,
    }

    let mut raw_netwops = Vec::with_capacity(netwop_count as usize);
    for _ in 0..netwop_count {
        raw_netwops.push(RawNetwop {
            cni: cur.u16()?,
            start_no: cur.u16()?,
            stop_no: cur.u16()?,
            stop_no_swo: cur.u16()?,
            lto: cur.u8()? as i8,
            day_count: cur.u8()?,
            alphabet: cur.u8()?,
            name_len: cur.u8()?,
            add_info: cur.u16()?,
        });
    }

    // string table: service name first, then one name per netwop
    let service_name = decode_string(cur.text_bytes(service_name_len)?, 0).into_boxed_str();
    let mut netwops = Vec::with_capacity(raw_netwops.len());
    for raw in raw_netwops {
        let name = decode_string(cur.text_bytes(raw.name_len as usize)?, raw.alphabet);
        netwops.push(AiNetwop {
            cni: Cni(raw.cni),
            start_no: raw.start_no,
            stop_no: raw.stop_no,
            stop_no_swo: raw.stop_no_swo,
            lto: raw.lto,
            day_count: raw.day_count,
            alphabet: raw.alphabet,
            add_info: raw.add_info & 0x0FFF,
            name: name.into_boxed_str(),
        });
    }

    Ok(Ai {
        version,
        version_swo,
        this_netwop,
        ni_count,
        ni_count_swo,
        oi_count,
        oi_count_swo,
        mi_count,
        mi_count_swo,
        service_name,
        netwops,
    })
}
