/// Wire codec for debug records
///
/// This module encodes and decodes the fixed little-endian layouts used at
/// the tools boundary: the event record delivered by `read_event` and the
/// self-describing register state area addressed by `read_state`.

use crate::types::{
    DebugEvent, DetachReason, DriverError, EventInfo, EventKind, ModuleRange, RegisterFile,
    Result, StateHeader, StateSection,
};

/// Fixed prefix of every event record: kind, thread, flags.
pub const EVENT_FIXED_LEN: usize = 1 + 8 + 8;

/// Size of the register state header on the wire.
pub const STATE_HEADER_LEN: usize = 8;

/// Size of one register file descriptor on the wire.
pub const STATE_SECTION_LEN: usize = 16;

/// Encoded size of an event record of the given kind.
pub fn encoded_event_len(kind: EventKind) -> usize {
    let info = match kind {
        EventKind::Detached => 1,
        EventKind::ModuleLoad | EventKind::ModuleUnload => 24,
        _ => 0,
    };
    EVENT_FIXED_LEN + info
}

/// The largest encoded event record; callers that cannot query a pending
/// event's size should size their buffer to this.
pub const MAX_EVENT_LEN: usize = EVENT_FIXED_LEN + 24;

/// Encode an event record into `buf`, returning the number of bytes written.
///
/// Fails with `OutOfHostMemory` when the buffer is too small and with
/// `InvalidArgument` when the payload does not match the event kind.
pub fn encode_event(event: &DebugEvent, buf: &mut [u8]) -> Result<usize> {
    let needed = encoded_event_len(event.kind);
    if buf.len() < needed {
        return Err(DriverError::OutOfHostMemory);
    }

    buf[0] = event.kind as u8;
    buf[1..9].copy_from_slice(&event.thread.to_le_bytes());
    buf[9..17].copy_from_slice(&event.flags.to_le_bytes());

    match (event.kind, &event.info) {
        (EventKind::Detached, EventInfo::Detached { reason }) => {
            buf[17] = *reason as u8;
        }
        (EventKind::ModuleLoad, EventInfo::Module(range))
        | (EventKind::ModuleUnload, EventInfo::Module(range)) => {
            buf[17..25].copy_from_slice(&range.begin.to_le_bytes());
            buf[25..33].copy_from_slice(&range.end.to_le_bytes());
            buf[33..41].copy_from_slice(&range.load.to_le_bytes());
        }
        (
            EventKind::ProcessEntry | EventKind::ProcessExit | EventKind::Exception,
            EventInfo::None,
        ) => {}
        _ => return Err(DriverError::InvalidArgument),
    }

    Ok(needed)
}

/// Decode an event record from the front of `buf`.
pub fn decode_event(buf: &[u8]) -> Result<DebugEvent> {
    if buf.len() < EVENT_FIXED_LEN {
        return Err(DriverError::InvalidArgument);
    }

    let kind = EventKind::from_wire(buf[0])?;
    if buf.len() < encoded_event_len(kind) {
        return Err(DriverError::InvalidArgument);
    }

    let thread = u64::from_le_bytes(buf[1..9].try_into().unwrap());
    let flags = u64::from_le_bytes(buf[9..17].try_into().unwrap());

    let info = match kind {
        EventKind::Detached => EventInfo::Detached {
            reason: DetachReason::from_wire(buf[17])?,
        },
        EventKind::ModuleLoad | EventKind::ModuleUnload => EventInfo::Module(ModuleRange {
            begin: u64::from_le_bytes(buf[17..25].try_into().unwrap()),
            end: u64::from_le_bytes(buf[25..33].try_into().unwrap()),
            load: u64::from_le_bytes(buf[33..41].try_into().unwrap()),
        }),
        _ => EventInfo::None,
    };

    Ok(DebugEvent {
        kind,
        thread,
        flags,
        info,
    })
}

/// Parse the register state header from the front of a state area.
pub fn parse_state_header(bytes: &[u8]) -> Result<StateHeader> {
    if bytes.len() < STATE_HEADER_LEN {
        return Err(DriverError::InvalidArgument);
    }

    let header = StateHeader {
        size: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        header_size: bytes[4],
        sec_size: bytes[5],
        num_sec: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
    };

    // The descriptor table must fit inside the declared area.
    let table_end =
        header.header_size as u64 + header.num_sec as u64 * header.sec_size as u64;
    if (header.header_size as usize) < STATE_HEADER_LEN
        || (header.sec_size as usize) < STATE_SECTION_LEN
        || table_end > header.size as u64
    {
        return Err(DriverError::InvalidArgument);
    }

    Ok(header)
}

/// Parse the register file descriptors of a state area.
///
/// `bytes` must cover at least the header and descriptor table. Descriptors
/// larger than this driver knows are tolerated; the extra bytes are skipped.
pub fn parse_state_sections(bytes: &[u8]) -> Result<Vec<StateSection>> {
    let header = parse_state_header(bytes)?;

    let table_end = header.header_size as usize + header.num_sec as usize * header.sec_size as usize;
    if bytes.len() < table_end {
        return Err(DriverError::InvalidArgument);
    }

    let mut sections = Vec::with_capacity(header.num_sec as usize);
    for index in 0..header.num_sec as usize {
        let at = header.header_size as usize + index * header.sec_size as usize;
        let desc = &bytes[at..at + STATE_SECTION_LEN];

        let section = StateSection {
            kind: u16::from_le_bytes(desc[0..2].try_into().unwrap()),
            version: u16::from_le_bytes(desc[2..4].try_into().unwrap()),
            size: u32::from_le_bytes(desc[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(desc[8..16].try_into().unwrap()),
        };

        if section.offset + section.size as u64 > header.size as u64 {
            return Err(DriverError::InvalidArgument);
        }
        sections.push(section);
    }

    Ok(sections)
}

/// Builds a register state area: header, descriptor table, then the
/// register bytes of each file at its declared offset.
pub struct StateAreaBuilder {
    sections: Vec<(RegisterFile, u16, Vec<u8>)>,
}

impl StateAreaBuilder {
    pub fn new() -> Self {
        StateAreaBuilder {
            sections: Vec::new(),
        }
    }

    /// Append a register file with its layout version and initial contents.
    pub fn section(mut self, kind: RegisterFile, version: u16, data: Vec<u8>) -> Self {
        self.sections.push((kind, version, data));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let table_len = self.sections.len() * STATE_SECTION_LEN;
        let payload_len: usize = self.sections.iter().map(|(_, _, data)| data.len()).sum();
        let total = STATE_HEADER_LEN + table_len + payload_len;

        let mut area = vec![0u8; total];
        area[0..4].copy_from_slice(&(total as u32).to_le_bytes());
        area[4] = STATE_HEADER_LEN as u8;
        area[5] = STATE_SECTION_LEN as u8;
        area[6..8].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());

        let mut offset = STATE_HEADER_LEN + table_len;
        for (index, (kind, version, data)) in self.sections.iter().enumerate() {
            let at = STATE_HEADER_LEN + index * STATE_SECTION_LEN;
            area[at..at + 2].copy_from_slice(&(*kind as u16).to_le_bytes());
            area[at + 2..at + 4].copy_from_slice(&version.to_le_bytes());
            area[at + 4..at + 8].copy_from_slice(&(data.len() as u32).to_le_bytes());
            area[at + 8..at + 16].copy_from_slice(&(offset as u64).to_le_bytes());

            area[offset..offset + data.len()].copy_from_slice(data);
            offset += data.len();
        }

        area
    }
}

impl Default for StateAreaBuilder {
    fn default() -> Self {
        StateAreaBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EVENT_FLAG_STOPPED, THREAD_NONE};

    #[test]
    fn test_exception_roundtrip() {
        let event = DebugEvent::exception(42);
        let mut buf = [0u8; MAX_EVENT_LEN];

        let written = encode_event(&event, &mut buf).unwrap();
        assert_eq!(written, EVENT_FIXED_LEN);

        let decoded = decode_event(&buf[..written]).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.flags & EVENT_FLAG_STOPPED, EVENT_FLAG_STOPPED);
    }

    #[test]
    fn test_detached_roundtrip() {
        let event = DebugEvent::detached(DetachReason::HostExit);
        let mut buf = [0u8; MAX_EVENT_LEN];

        let written = encode_event(&event, &mut buf).unwrap();
        assert_eq!(written, EVENT_FIXED_LEN + 1);

        let decoded = decode_event(&buf[..written]).unwrap();
        assert_eq!(decoded.kind, EventKind::Detached);
        assert_eq!(decoded.thread, THREAD_NONE);
        assert_eq!(
            decoded.info,
            EventInfo::Detached {
                reason: DetachReason::HostExit
            }
        );
    }

    #[test]
    fn test_module_load_roundtrip() {
        let range = ModuleRange {
            begin: 0x1000,
            end: 0x5000,
            load: 0x8000_0000,
        };
        let event = DebugEvent::module_load(range);
        let mut buf = [0u8; MAX_EVENT_LEN];

        let written = encode_event(&event, &mut buf).unwrap();
        assert_eq!(written, EVENT_FIXED_LEN + 24);

        let decoded = decode_event(&buf[..written]).unwrap();
        assert_eq!(decoded.info, EventInfo::Module(range));
    }

    #[test]
    fn test_encode_into_short_buffer() {
        let event = DebugEvent::module_load(ModuleRange {
            begin: 0,
            end: 0x100,
            load: 0x100,
        });
        let mut buf = [0u8; EVENT_FIXED_LEN];

        assert_eq!(
            encode_event(&event, &mut buf),
            Err(DriverError::OutOfHostMemory)
        );
    }

    #[test]
    fn test_decode_rejects_invalid_kind() {
        let mut buf = [0u8; MAX_EVENT_LEN];
        encode_event(&DebugEvent::exception(1), &mut buf).unwrap();
        buf[0] = 0xff;

        assert_eq!(decode_event(&buf), Err(DriverError::InvalidArgument));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let event = DebugEvent::detached(DetachReason::HostExit);
        let mut buf = [0u8; MAX_EVENT_LEN];
        encode_event(&event, &mut buf).unwrap();

        // Fixed prefix alone is not enough for a detached record.
        assert_eq!(
            decode_event(&buf[..EVENT_FIXED_LEN]),
            Err(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn test_state_area_roundtrip() {
        let area = StateAreaBuilder::new()
            .section(RegisterFile::General, 1, vec![0xab; 256])
            .section(RegisterFile::Accumulator, 1, vec![0; 32])
            .section(RegisterFile::Flags, 2, vec![0; 4])
            .build();

        let header = parse_state_header(&area).unwrap();
        assert_eq!(header.size as usize, area.len());
        assert_eq!(header.header_size as usize, STATE_HEADER_LEN);
        assert_eq!(header.sec_size as usize, STATE_SECTION_LEN);
        assert_eq!(header.num_sec, 3);

        let sections = parse_state_sections(&area).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].kind, RegisterFile::General as u16);
        assert_eq!(sections[0].size, 256);
        assert_eq!(sections[2].version, 2);

        // Register bytes live where the descriptors say they do.
        let grf = &sections[0];
        let at = grf.offset as usize;
        assert!(area[at..at + grf.size as usize].iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_state_sections_are_disjoint() {
        let area = StateAreaBuilder::new()
            .section(RegisterFile::General, 1, vec![0; 128])
            .section(RegisterFile::Address, 1, vec![0; 64])
            .build();

        let sections = parse_state_sections(&area).unwrap();
        let first_end = sections[0].offset + sections[0].size as u64;
        assert!(sections[1].offset >= first_end);
    }

    #[test]
    fn test_parse_rejects_overflowing_section() {
        let mut area = StateAreaBuilder::new()
            .section(RegisterFile::General, 1, vec![0; 64])
            .build();

        // Corrupt the descriptor so the section runs past the declared size.
        let at = STATE_HEADER_LEN + 4;
        area[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert_eq!(
            parse_state_sections(&area),
            Err(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn test_parse_rejects_short_header() {
        assert_eq!(
            parse_state_header(&[0u8; 4]),
            Err(DriverError::InvalidArgument)
        );
    }
}
