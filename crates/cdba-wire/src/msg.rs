/// Wire message types.
///
/// The discriminants are the on-wire values and are shared by both peers;
/// never reorder or renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    SelectBoard = 0,
    Console = 1,
    /// Reserved; neither peer acts on it.
    HardReset = 2,
    PowerOn = 3,
    PowerOff = 4,
    FastbootPresent = 5,
    FastbootDownload = 6,
    /// Reserved; neither peer acts on it.
    FastbootBoot = 7,
    StatusUpdate = 8,
    VbusOn = 9,
    VbusOff = 10,
    SendBreak = 11,
    ListDevices = 12,
    BoardInfo = 13,
    FastbootContinue = 14,
}

impl MsgType {
    pub fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::SelectBoard,
            1 => Self::Console,
            2 => Self::HardReset,
            3 => Self::PowerOn,
            4 => Self::PowerOff,
            5 => Self::FastbootPresent,
            6 => Self::FastbootDownload,
            7 => Self::FastbootBoot,
            8 => Self::StatusUpdate,
            9 => Self::VbusOn,
            10 => Self::VbusOff,
            11 => Self::SendBreak,
            12 => Self::ListDevices,
            13 => Self::BoardInfo,
            14 => Self::FastbootContinue,
            _ => return None,
        })
    }
}

impl From<MsgType> for u8 {
    fn from(kind: MsgType) -> Self {
        kind as Self
    }
}

/// One decoded frame.
///
/// `kind` stays raw: a type unknown to this peer is not a codec error, it is
/// surfaced to the session layer which decides whether to terminate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(kind: MsgType, payload: impl Into<Vec<u8>>) -> Self {
        Self { kind: kind.into(), payload: payload.into() }
    }

    pub fn empty(kind: MsgType) -> Self {
        Self { kind: kind.into(), payload: Vec::new() }
    }

    /// The typed view of `kind`, if this peer knows it.
    pub fn typed(&self) -> Option<MsgType> {
        MsgType::from_wire(self.kind)
    }
}
