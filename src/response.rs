use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illigal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
}

impl R1Response {
    /// Command accepted, card ready.
    pub const READY_STATE: Self = R1Response(0x00);
    /// Command accepted, card still initializing.
    pub const IN_IDLE_STATE: Self = R1Response(0x01);
    /// Nothing but an idle bus, also returned when the card never became ready to
    /// take the command.
    pub const NO_RESPONSE: Self = R1Response(0xFF);

    /// Start bit is clear, so the byte is an R1 and not bus filler.
    pub fn is_valid(&self) -> bool {
        self.0 & 0x80 == 0
    }

    /// Ready or idle, no error bits.
    pub fn is_accepted(&self) -> bool {
        self.0 <= Self::IN_IDLE_STATE.0
    }
}

/// R3 OCR payload.
pub type OcrData = [u8; 4];
/// R7 interface condition payload.
pub type R7Payload = [u8; 4];
