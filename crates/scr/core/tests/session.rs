//! Session lifecycle against simulated cards

use nexum_scr_core::atr::BitConvention;
use nexum_scr_core::contacts::ContactEvent;
use nexum_scr_core::io::script::{Arrival, ScriptedIo};
use nexum_scr_core::pps::{PpsParams, build_pps_request};
use nexum_scr_core::sim::{SimulatedCard, T0_ATR, T1_ATR};
use nexum_scr_core::{
    CardPersonality, DeviceType, ParsedAtr, PresenceEvent, Protocol, ProtocolError, ResetKind, ResetTiming, Session,
    SessionConfig, State, StaticContacts, VoltageClass, parse_atr, t0,
};

const SELECT: [u8; 5] = [0x00, 0xA4, 0x04, 0x00, 0x00];

fn config() -> SessionConfig {
    SessionConfig::new()
        .with_clock_frequency(7_142_400)
        .with_reset_timing(ResetTiming::IMMEDIATE)
}

fn session(io: ScriptedIo) -> Session<ScriptedIo> {
    Session::new(io, StaticContacts::new(true), config())
}

#[test]
fn test_t0_card_end_to_end() {
    let mut session = session(SimulatedCard::new(Protocol::T0).into_io());
    assert_eq!(session.state(), State::CardPresent);

    let atr = session.reset(ResetKind::Cold).unwrap();
    assert_eq!(atr.raw.as_ref(), &T0_ATR);
    assert_eq!(atr.parsed.history_len(), 5);
    assert_eq!(session.state(), State::Ready);
    assert_eq!(session.capabilities().protocol, Protocol::T0);
    assert_eq!(session.capabilities().baud_rate(), 9600);
    assert!(session.capabilities().uart_config().nack);

    let response = session.transfer(&SELECT, 3000).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
    assert_eq!(session.state(), State::Ready);
    assert_eq!(session.io().written().last().unwrap(), &SELECT.to_vec());

    // Cold reset: power down, class, VCC, then clock under RST low
    let events = session.contacts().events();
    assert_eq!(events[3], ContactEvent::Class(VoltageClass::A));
    assert_eq!(events[4], ContactEvent::Vcc(true));
    assert_eq!(events[5], ContactEvent::Reset(false));
    assert_eq!(events[7], ContactEvent::Reset(true));
}

#[test]
fn test_t1_card_with_pps_and_ifsd() {
    let mut session = session(SimulatedCard::new(Protocol::T1).into_io());
    let atr = session.reset(ResetKind::Cold).unwrap();
    assert_eq!(atr.raw.as_ref(), &T1_ATR);
    assert_eq!(session.capabilities().protocol, Protocol::T1);
    assert_eq!(session.capabilities().baud_rate(), 9600);

    // TA1 = 96 is offered; the card confirms it
    let request = build_pps_request(PpsParams::new(1).with_fd(9, 6));
    let response = session.negotiate_pps(request).unwrap();
    assert_eq!(&response[..4], &request[..4]);
    assert_eq!(session.capabilities().baud_rate(), 223_200);
    assert_eq!(session.io().configs().last().unwrap().baud_rate, 223_200);
    assert_eq!(session.state(), State::Ready);

    assert_eq!(session.negotiate_ifsd(100), Ok(100));
    let response = session.transfer(&[0x00, 0xB0, 0x00, 0x00, 0x00, 0x01, 0x00], 0).unwrap();
    assert_eq!(response.len(), 258);
    assert_eq!(&response[256..], &[0x90, 0x00]);
    assert_eq!(session.t1_context().unwrap().bytes_read, 258);
}

#[test]
fn test_no_card() {
    let mut session = Session::new(ScriptedIo::new(), StaticContacts::new(false), config());
    assert_eq!(session.state(), State::CardNotPresent);
    assert_eq!(session.reset(ResetKind::Cold), Err(ProtocolError::NoCard));
    assert_eq!(session.transfer(&SELECT, 100), Err(ProtocolError::NoCard));
    assert_eq!(session.last_error(), Some(&ProtocolError::NoCard));
}

#[test]
fn test_commands_need_reset() {
    let mut session = session(SimulatedCard::new(Protocol::T0).into_io());
    assert_eq!(
        session.transfer(&SELECT, 100),
        Err(ProtocolError::NotReady(State::CardPresent))
    );
    assert!(session.io().written().is_empty());
}

#[test]
fn test_mute_card_stays_present() {
    let mut session = Session::new(ScriptedIo::new(), StaticContacts::new(true), config().with_dual_class(true));
    assert_eq!(session.reset(ResetKind::Cold), Err(ProtocolError::Timeout));
    assert_eq!(session.state(), State::CardPresent);
    assert_eq!(session.last_error(), Some(&ProtocolError::Timeout));
    assert_eq!(session.voltage_class(), VoltageClass::B);

    let classes: Vec<_> = session
        .contacts()
        .events()
        .iter()
        .filter(|event| matches!(event, ContactEvent::Class(_)))
        .collect();
    assert_eq!(
        classes,
        [&ContactEvent::Class(VoltageClass::A), &ContactEvent::Class(VoltageClass::B)]
    );
}

#[test]
fn test_dual_class_retry_succeeds() {
    // The ATR only shows up after the first attempt has given up
    let mut io = ScriptedIo::new();
    io.push_after(1500, T0_ATR);
    let mut session = Session::new(io, StaticContacts::new(true), config().with_dual_class(true));
    let atr = session.reset(ResetKind::Cold).unwrap();
    assert_eq!(atr.raw.as_ref(), &T0_ATR);
    assert_eq!(session.voltage_class(), VoltageClass::B);
    assert_eq!(session.state(), State::Ready);
}

#[test]
fn test_lost_t1_card_needs_reset() {
    let mut io = ScriptedIo::new();
    io.push(T1_ATR);
    let mut session = session(io);
    session.reset(ResetKind::Warm).unwrap();
    assert!(session.t1_context().is_some());

    assert_eq!(session.transfer(&SELECT, 0), Err(ProtocolError::Unrecoverable));
    assert_eq!(session.state(), State::CardPresent);
    assert!(session.t1_context().is_none());
    assert_eq!(
        session.transfer(&SELECT, 0),
        Err(ProtocolError::NotReady(State::CardPresent))
    );
    assert_eq!(session.last_error(), Some(&ProtocolError::Unrecoverable));
}

#[test]
fn test_t0_timeout_keeps_session_ready() {
    let mut slow = true;
    let mut io = ScriptedIo::with_responder(move |_| {
        let delay = if slow { 101 } else { 99 };
        slow = false;
        vec![Arrival::after(delay, [0x90, 0x00])]
    });
    io.push(T0_ATR);
    let mut session = session(io);
    session.reset(ResetKind::Cold).unwrap();

    assert_eq!(session.transfer(&SELECT, 100), Err(ProtocolError::Timeout));
    assert_eq!(session.state(), State::Ready);
    // The late status of the first command is still on the wire
    let response = session.transfer(&SELECT, 100).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
}

#[test]
fn test_timeout_boundary() {
    let mut on_time = ScriptedIo::with_responder(|_| vec![Arrival::after(99, [0x90, 0x00])]);
    assert_eq!(t0::transfer(&mut on_time, &SELECT, 100).unwrap().as_ref(), &[0x90, 0x00]);

    let mut late = ScriptedIo::with_responder(|_| vec![Arrival::after(101, [0x90, 0x00])]);
    assert_eq!(t0::transfer(&mut late, &SELECT, 100), Err(ProtocolError::Timeout));
}

#[test]
fn test_lifecycle() {
    let mut session = session(SimulatedCard::new(Protocol::T0).into_io());
    session.reset(ResetKind::Cold).unwrap();

    session.deactivate().unwrap();
    assert_eq!(session.state(), State::CardPresent);
    assert!(session.atr().is_none());
    assert_eq!(session.contacts().events().last(), Some(&ContactEvent::Vcc(false)));

    session.suspend().unwrap();
    assert_eq!(session.state(), State::LowPower);
    assert_eq!(
        session.reset(ResetKind::Cold),
        Err(ProtocolError::NotReady(State::LowPower))
    );
    session.resume().unwrap();
    assert_eq!(session.state(), State::CardPresent);

    session.presence(PresenceEvent::Removed).unwrap();
    assert_eq!(session.state(), State::CardNotPresent);
    session.presence(PresenceEvent::Inserted).unwrap();
    assert_eq!(session.state(), State::CardPresent);

    session.close().unwrap();
    assert_eq!(session.state(), State::Delete);
    assert_eq!(session.reset(ResetKind::Cold), Err(ProtocolError::NotReady(State::Delete)));
    assert!(session.deactivate().is_err());
}

#[test]
fn test_clock_change_respects_fmax() {
    let mut session = session(SimulatedCard::new(Protocol::T0).into_io());
    session.reset(ResetKind::Cold).unwrap();
    // No TA1: fmax stays at 5 MHz, so 3.5712 MHz is the best on offer
    assert_eq!(session.change_clock_frequency(20_000_000), Ok(3_571_200));
    assert_eq!(session.change_clock_frequency(1_000_000), Ok(892_800));
    assert_eq!(session.capabilities().clock_divider, 4);
    assert_eq!(session.state(), State::Ready);
}

#[test]
fn test_inverse_convention_card() {
    let mut logical = T0_ATR;
    logical[0] = 0x3F;
    let mut line = logical;
    BitConvention::Inverse.transcode(&mut line);
    assert_eq!(line[0], 0x03);

    let mut session = session(SimulatedCard::with_atr(Protocol::T0, line).into_io());
    let atr = session.reset(ResetKind::Cold).unwrap();
    assert_eq!(atr.raw.as_ref(), &logical);
    assert_eq!(atr.parsed.convention, BitConvention::Inverse);
    // Apart from TS the card announces exactly what the direct one does
    let direct = parse_atr(&T0_ATR).unwrap();
    assert_eq!(
        ParsedAtr {
            convention: BitConvention::Direct,
            ..atr.parsed.clone()
        },
        direct
    );
    assert_eq!(session.io().configs().last().unwrap().convention, BitConvention::Inverse);

    let response = session.transfer(&SELECT, 3000).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
    // CLA 00 goes out as FF
    assert_eq!(session.io().written().last().unwrap()[0], 0xFF);
}

#[test]
fn test_t1_write_stall_honours_transfer_timeout() {
    let mut session = session(SimulatedCard::new(Protocol::T1).into_io());
    session.reset(ResetKind::Cold).unwrap();
    session.io_mut().stall_writes(80);

    assert_eq!(session.transfer(&SELECT, 50), Err(ProtocolError::Timeout));
    assert_eq!(session.state(), State::Ready);
    assert!(session.t1_context().is_some());
    assert!(session.io().written().is_empty());

    // The block was never sent, so the link carries on in sequence
    let response = session.transfer(&SELECT, 100).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
}

/// Vendor tweak that doubles the bit rate the card asked for
#[derive(Debug)]
struct DoubleRate;

impl CardPersonality for DoubleRate {
    fn update_fi_di(&self, fi_index: u8, _di_index: u8) -> (u8, u8) {
        (fi_index, 2)
    }
}

#[test]
fn test_injected_ca_personality() {
    let io = SimulatedCard::new(Protocol::T1).into_io();
    let ca_config = config().with_device_type(DeviceType::Ca);
    let mut session = Session::with_personality(io, StaticContacts::new(true), ca_config, Box::new(DoubleRate));
    session.reset(ResetKind::Cold).unwrap();
    assert_eq!(session.capabilities().baud_rate(), 19_200);
    assert_eq!(session.io().configs().last().unwrap().baud_rate, 19_200);

    // Outside CA mode the personality's Fi/Di hook is not consulted
    let io = SimulatedCard::new(Protocol::T1).into_io();
    let mut session = Session::with_personality(io, StaticContacts::new(true), config(), Box::new(DoubleRate));
    session.reset(ResetKind::Cold).unwrap();
    assert_eq!(session.capabilities().baud_rate(), 9600);
}
