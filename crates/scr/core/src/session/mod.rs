//! Card session state machine
//!
//! A [`Session`] owns the byte channel and the contacts of one slot and runs
//! every protocol operation to completion before the next one starts. The
//! [`worker`] module moves a session onto its own thread and feeds it
//! through a bounded request queue.

pub mod event;
pub mod state;
pub mod worker;

use std::time::Duration;

use bytes::Bytes;
use derive_more::Display;
pub use event::PresenceEvent;
pub use state::State;
use tracing::{debug, info, instrument, warn};
pub use worker::{SessionHandle, SessionWorker};

use crate::atr::{
    AtrResponse, BitConvention, MAX_ATR_LEN, ParsedAtr, Protocol, ProtocolSet, TS_DIRECT, TS_INVERSE,
    TS_INVERSE_AS_DIRECT, interface_bytes_flagged, parse_atr, tck_required,
};
use crate::capabilities::Capabilities;
use crate::config::{DeviceType, SessionConfig};
use crate::contacts::{CardContacts, StaticContacts, VoltageClass};
use crate::error::{AtrError, ProtocolError, Result};
use crate::io::{AbortHandle, ByteIo, UartConfig};
use crate::personality::{CardPersonality, default_personality};
use crate::pps::{MAX_PPS_LEN, PpsExchange, check_request, parse_pps_response, pps_len};
use crate::t0::T0Engine;
use crate::t1::{T1BlockContext, T1Engine};
use crate::t14;
use crate::timing::closest_divider;

/// Kind of reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResetKind {
    /// Power cycle followed by RST
    #[display("cold")]
    Cold,
    /// RST only, with power applied
    #[display("warm")]
    Warm,
}

/// One card slot and the protocol state of the card in it
#[derive(Debug)]
pub struct Session<I: ByteIo, C: CardContacts = StaticContacts> {
    io: I,
    contacts: C,
    config: SessionConfig,
    personality: Box<dyn CardPersonality>,
    state: State,
    card_present: bool,
    class: VoltageClass,
    caps: Capabilities,
    atr: Option<AtrResponse>,
    t1: Option<T1BlockContext>,
    last_error: Option<ProtocolError>,
    abort: AbortHandle,
}

impl<I: ByteIo, C: CardContacts> Session<I, C> {
    /// Open a session with the personality selected by the configuration
    pub fn new(io: I, contacts: C, config: SessionConfig) -> Self {
        let personality = default_personality(config.device_type);
        Self::with_personality(io, contacts, config, personality)
    }

    /// Open a session with an explicit personality
    pub fn with_personality(
        io: I,
        contacts: C,
        mut config: SessionConfig,
        personality: Box<dyn CardPersonality>,
    ) -> Self {
        personality.populate_init_params(&mut config);
        let abort = io.abort_handle();
        let card_present = contacts.card_present();
        let mut session = Self {
            caps: Capabilities::initial(&config),
            io,
            contacts,
            config,
            personality,
            state: State::Open,
            card_present,
            class: VoltageClass::default(),
            atr: None,
            t1: None,
            last_error: None,
            abort,
        };
        session.state = if card_present { State::CardPresent } else { State::CardNotPresent };
        debug!(state = %session.state, "Session opened");
        session
    }

    /// Current state
    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether a card is in the slot
    pub const fn card_present(&self) -> bool {
        self.card_present
    }

    /// Current parameters
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// ATR of the last successful reset
    pub const fn atr(&self) -> Option<&AtrResponse> {
        self.atr.as_ref()
    }

    /// Last error that was not recovered
    pub const fn last_error(&self) -> Option<&ProtocolError> {
        self.last_error.as_ref()
    }

    /// Session configuration
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Currently selected voltage class
    pub const fn voltage_class(&self) -> VoltageClass {
        self.class
    }

    /// T=1 link state, when T=1 is active
    pub const fn t1_context(&self) -> Option<&T1BlockContext> {
        self.t1.as_ref()
    }

    /// The byte channel
    pub const fn io(&self) -> &I {
        &self.io
    }

    /// The byte channel, mutably
    pub const fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// The slot contacts
    pub const fn contacts(&self) -> &C {
        &self.contacts
    }

    /// Handle that interrupts the operation in progress
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Interrupt the operation in progress
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Reset the card and read its ATR
    ///
    /// On a dual-class slot a failed reset is retried once in the other
    /// voltage class. A card that still does not answer leaves the session in
    /// [`State::CardPresent`].
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&mut self, kind: ResetKind) -> Result<AtrResponse> {
        if matches!(self.state, State::Open | State::LowPower | State::Delete) {
            return Err(ProtocolError::NotReady(self.state));
        }
        if !self.card_present {
            return Err(self.record(ProtocolError::NoCard));
        }
        self.set_state(State::CardPresent)?;
        self.atr = None;
        self.t1 = None;

        let result = match self.activate(kind) {
            Err(err) if self.config.dual_class && !matches!(err.root(), ProtocolError::Aborted) => {
                self.class = self.class.toggled();
                warn!(%err, class = %self.class, "Reset failed, retrying in the other voltage class");
                self.activate(ResetKind::Cold)
            }
            other => other,
        };

        match result {
            Ok(atr) => {
                self.set_state(State::Ready)?;
                info!(atr = %hex::encode(&atr.raw), protocol = %self.caps.protocol, "Card ready");
                Ok(atr)
            }
            Err(err) => {
                warn!(%err, "Reset failed");
                Err(self.record(err))
            }
        }
    }

    /// Send a PPS request and apply the parameters the card confirms
    ///
    /// A rejected negotiation keeps the parameters derived from the ATR.
    #[instrument(level = "debug", skip_all, fields(request = %hex::encode(request)))]
    pub fn negotiate_pps(&mut self, request: [u8; MAX_PPS_LEN]) -> Result<[u8; MAX_PPS_LEN]> {
        self.ensure_ready()?;
        let len = check_request(&request)?;
        let parsed = self.parsed_atr()?;
        self.set_state(State::Process)?;

        let result = self.exchange_pps(&request, len).and_then(|exchange| {
            self.apply_parameters(&parsed, |caps, personality, ca| {
                let mut info = exchange.info;
                if ca {
                    (info.f_int, info.d_int) = personality.update_fi_di(info.f_int, info.d_int);
                }
                caps.apply_pps(&info, &parsed)?;
                Ok((info.f_int, info.d_int))
            })?;
            debug!(info = ?exchange.info, "PPS accepted");
            Ok(exchange.response)
        });
        if let Err(err) = &result {
            warn!(%err, "PPS failed, keeping ATR parameters");
        }
        self.finish(result)
    }

    /// Exchange an APDU (T=0, T=1) or a raw frame (T=14)
    ///
    /// A zero `timeout_ms` selects the configured default.
    #[instrument(level = "debug", skip_all, fields(len = apdu.len()))]
    pub fn transfer(&mut self, apdu: &[u8], timeout_ms: u32) -> Result<Bytes> {
        self.ensure_ready()?;
        let timeout_ms = if timeout_ms == 0 { self.config.default_timeout_ms } else { timeout_ms };
        self.set_state(State::Process)?;
        let result = self.dispatch(apdu, timeout_ms);
        self.finish(result)
    }

    /// Announce the reader's information field size (T=1 only)
    pub fn negotiate_ifsd(&mut self, ifsd: u8) -> Result<u8> {
        self.ensure_ready()?;
        if self.caps.protocol != Protocol::T1 {
            return Err(ProtocolError::UnsupportedProtocol(self.caps.protocol.number()));
        }
        self.set_state(State::Process)?;
        let result = self.io.flush().map_err(ProtocolError::from).and_then(|()| {
            let state = self.state;
            let ctx = self.t1.as_mut().ok_or(ProtocolError::NotReady(state))?;
            T1Engine::new(&mut self.io, ctx).negotiate_ifsd(ifsd)
        });
        self.finish(result)
    }

    /// Run the card clock as close to `frequency` as the divider and TA1 allow
    ///
    /// Returns the frequency actually programmed.
    pub fn change_clock_frequency(&mut self, frequency: u32) -> Result<u32> {
        self.ensure_ready()?;
        let parsed = self.parsed_atr()?;
        let divider = closest_divider(self.caps.clock_frequency, frequency, self.caps.max_clock_frequency);
        let mut caps = self.caps.clone();
        caps.set_clock_divider(divider, &parsed)?;
        self.contacts.set_clock(Some(caps.working_frequency))?;
        self.program_uart(&caps)?;
        if let Some(ctx) = &mut self.t1 {
            ctx.timeouts = caps.timeouts;
        }
        debug!(divider, working = caps.working_frequency, "Clock changed");
        self.caps = caps;
        Ok(self.caps.working_frequency)
    }

    /// Release the contacts; a new reset is required afterwards
    #[instrument(level = "debug", skip(self))]
    pub fn deactivate(&mut self) -> Result<()> {
        self.set_state(State::Deactivate)?;
        self.power_down()?;
        self.forget_card();
        let next = if self.card_present { State::CardPresent } else { State::CardNotPresent };
        self.set_state(next)
    }

    /// Power the slot down
    pub fn suspend(&mut self) -> Result<()> {
        self.state.transition(State::LowPower)?;
        if self.card_present {
            self.power_down()?;
        }
        self.forget_card();
        self.set_state(State::LowPower)
    }

    /// Leave low power; the card needs a new reset
    pub fn resume(&mut self) -> Result<()> {
        if self.state != State::LowPower {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to: State::CardPresent,
            });
        }
        let next = if self.card_present { State::CardPresent } else { State::CardNotPresent };
        self.set_state(next)
    }

    /// Close the session; every later operation fails
    pub fn close(&mut self) -> Result<()> {
        self.state.transition(State::Delete)?;
        if self.card_present {
            self.power_down()?;
        }
        self.forget_card();
        self.set_state(State::Delete)
    }

    /// Apply a card detect change
    pub fn presence(&mut self, event: PresenceEvent) -> Result<()> {
        if self.state == State::Delete {
            return Ok(());
        }
        self.card_present = event.is_present();
        match event {
            PresenceEvent::Removed => {
                info!("Card removed");
                self.forget_card();
                self.set_state(State::CardNotPresent)
            }
            PresenceEvent::Inserted => {
                info!("Card inserted");
                if matches!(self.state, State::Open | State::CardNotPresent) {
                    self.set_state(State::CardPresent)?;
                }
                Ok(())
            }
        }
    }

    fn set_state(&mut self, to: State) -> Result<()> {
        let next = self.state.transition(to)?;
        if next != self.state {
            debug!(from = %self.state, to = %next, "State change");
        }
        self.state = next;
        Ok(())
    }

    fn ensure_ready(&mut self) -> Result<()> {
        if !self.card_present {
            return Err(self.record(ProtocolError::NoCard));
        }
        if self.state != State::Ready {
            return Err(ProtocolError::NotReady(self.state));
        }
        Ok(())
    }

    fn record(&mut self, err: ProtocolError) -> ProtocolError {
        if err.root() != &ProtocolError::Aborted {
            self.last_error = Some(err.clone());
        }
        err
    }

    fn parsed_atr(&self) -> Result<ParsedAtr> {
        self.atr
            .as_ref()
            .map(|atr| atr.parsed.clone())
            .ok_or(ProtocolError::NotReady(self.state))
    }

    fn forget_card(&mut self) {
        self.atr = None;
        self.t1 = None;
        self.caps = Capabilities::initial(&self.config);
    }

    /// Leave `Process` after a command
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.set_state(State::Ready)?;
                Ok(value)
            }
            Err(err) => {
                let next = if err.is_fatal_to_session() {
                    warn!(%err, "Card lost protocol synchronisation");
                    self.t1 = None;
                    State::CardPresent
                } else {
                    debug!(%err, "Command failed");
                    State::Ready
                };
                self.set_state(next)?;
                Err(self.record(err))
            }
        }
    }

    fn dispatch(&mut self, apdu: &[u8], timeout_ms: u32) -> Result<Bytes> {
        self.io.flush()?;
        match self.caps.protocol {
            Protocol::T0 => T0Engine::new(&mut self.io, timeout_ms).transfer(apdu),
            Protocol::T1 => {
                let state = self.state;
                let ctx = self.t1.as_mut().ok_or(ProtocolError::NotReady(state))?;
                T1Engine::new(&mut self.io, ctx).with_timeout(timeout_ms).transfer(apdu)
            }
            Protocol::T14 => t14::transfer(&mut self.io, apdu, timeout_ms, self.caps.timeouts.cwt_ms),
        }
    }

    fn exchange_pps(&mut self, request: &[u8; MAX_PPS_LEN], len: usize) -> Result<PpsExchange> {
        let timeout = self.caps.timeouts.wwt_ms;
        self.io.flush()?;
        self.io.write(&request[..len], timeout)?;

        let mut response = [0u8; MAX_PPS_LEN];
        self.io.read(&mut response[..2], 2, timeout)?;
        let resp_len = pps_len(response[1]);
        self.io.read(&mut response[2..resp_len], resp_len - 2, timeout)?;
        let info = parse_pps_response(&request[..len], &response[..resp_len])?;
        Ok(PpsExchange {
            request: *request,
            response,
            info,
        })
    }

    /// Recompute the capabilities through `select`, then reprogram the UART
    /// and the T=1 link
    fn apply_parameters<F>(&mut self, parsed: &ParsedAtr, select: F) -> Result<()>
    where
        F: FnOnce(&mut Capabilities, &dyn CardPersonality, bool) -> Result<(u8, u8)>,
    {
        let ca = self.config.device_type == DeviceType::Ca;
        let mut caps = self.caps.clone();
        let (fi, di) = select(&mut caps, self.personality.as_ref(), ca)?;
        if ca {
            self.personality.recalc_etu(&mut caps, fi, di);
        }
        self.program_uart(&caps)?;
        self.t1 = (caps.protocol == Protocol::T1)
            .then(|| T1BlockContext::new(parsed, caps.timeouts, self.config.nad, self.config.ifsd));
        self.caps = caps;
        Ok(())
    }

    fn program_uart(&mut self, caps: &Capabilities) -> Result<()> {
        let config = UartConfig {
            baud_rate: caps.baud_rate(),
            stop_bits: self.personality.set_stopbits(&caps.timeouts.guard, caps.protocol),
            nack: self.personality.set_parity(caps.protocol),
            convention: caps.convention,
        };
        self.io.configure(&config)?;
        Ok(())
    }

    fn power_down(&mut self) -> Result<()> {
        self.contacts.set_reset(false)?;
        self.contacts.set_clock(None)?;
        self.contacts.set_vcc(false)?;
        Ok(())
    }

    /// Run the activation sequence and decode the ATR
    fn activate(&mut self, kind: ResetKind) -> Result<AtrResponse> {
        let timing = self.config.reset_timing;
        let mut caps = Capabilities::initial(&self.config);
        self.io.flush()?;

        if kind == ResetKind::Cold {
            self.power_down()?;
            self.io.pause(Duration::from_millis(timing.deactivation_ms));
            self.contacts.select_class(self.class)?;
            self.contacts.set_vcc(true)?;
            self.io.pause(Duration::from_millis(timing.vcc_settle_ms));
        }
        self.io.configure(&caps.uart_config())?;
        self.contacts.set_reset(false)?;
        self.contacts.set_clock(Some(caps.working_frequency))?;
        self.io.pause(Duration::from_millis(timing.rst_low_ms));
        self.contacts.set_reset(true)?;

        let (raw, iso_len) = self.read_atr(&mut caps)?;
        let parsed = parse_atr(&raw[..iso_len])?;
        self.caps = caps;
        self.apply_parameters(&parsed, |caps, personality, ca| {
            let (protocol, fi, di) = Capabilities::selection(&parsed)?;
            let (fi, di) = if ca { personality.update_fi_di(fi, di) } else { (fi, di) };
            caps.apply(protocol, fi, di, &parsed)?;
            Ok((fi, di))
        })?;

        let atr = AtrResponse {
            raw: Bytes::from(raw),
            parsed,
        };
        self.atr = Some(atr.clone());
        Ok(atr)
    }

    /// Read the ATR character by character, following the interface bytes
    ///
    /// Returns the bytes read and the length of the ISO part, which excludes
    /// any card-family trailing bytes.
    fn read_atr(&mut self, caps: &mut Capabilities) -> Result<(Vec<u8>, usize)> {
        let timeout = caps.atr_char_timeout_ms();
        let mut raw = Vec::with_capacity(MAX_ATR_LEN + self.config.extra_atr_bytes);

        let ts = match self.io.read_byte(timeout)? {
            ts @ (TS_DIRECT | TS_INVERSE) => ts,
            TS_INVERSE_AS_DIRECT => {
                debug!("Inverse convention detected");
                caps.convention = BitConvention::Inverse;
                self.io.configure(&caps.uart_config())?;
                TS_INVERSE
            }
            other => return Err(AtrError::InvalidTs(other).into()),
        };
        raw.push(ts);

        self.read_atr_bytes(&mut raw, 1, timeout)?;
        let t0 = raw[1];
        let mut y = t0;
        let mut protocols = ProtocolSet::default();
        loop {
            self.read_atr_bytes(&mut raw, interface_bytes_flagged(y), timeout)?;
            if y & 0x80 == 0 {
                break;
            }
            let Some(&td) = raw.last() else { break };
            if td & 0x0F != 15 {
                protocols.insert(td & 0x0F);
            }
            y = td;
        }
        self.read_atr_bytes(&mut raw, usize::from(t0 & 0x0F), timeout)?;

        if protocols.is_empty() {
            protocols.insert(0);
        }
        if tck_required(protocols) {
            self.read_atr_bytes(&mut raw, 1, timeout)?;
        }
        let iso_len = raw.len();

        let extra = self.config.extra_atr_bytes;
        if extra > 0 && protocols != ProtocolSet::T0_ONLY {
            for _ in 0..extra {
                raw.push(self.io.read_byte(timeout)?);
            }
            debug!(extra, "Read non-ISO ATR bytes");
        }
        Ok((raw, iso_len))
    }

    fn read_atr_bytes(&mut self, raw: &mut Vec<u8>, count: usize, timeout_ms: u32) -> Result<()> {
        if raw.len() + count > MAX_ATR_LEN {
            return Err(AtrError::TooLong(raw.len() + count).into());
        }
        for _ in 0..count {
            raw.push(self.io.read_byte(timeout_ms)?);
        }
        Ok(())
    }
}
