//! Command implementations for the scr CLI

use std::error::Error;

use nexum_scr_core::apdu::classify;
use nexum_scr_core::atr::{ParsedAtr, Protocol, parse_atr};
use nexum_scr_core::capabilities::Capabilities;
use nexum_scr_core::config::{ResetTiming, SessionConfig};
use nexum_scr_core::contacts::StaticContacts;
use nexum_scr_core::pps::{PpsParams, build_pps_request, check_request, parse_pps_response};
use nexum_scr_core::session::{ResetKind, Session, SessionWorker};
use nexum_scr_core::sim::SimulatedCard;
use nexum_scr_core::timing::compute_timeouts;
use nexum_scr_core::{StatusWord, Timeouts};
use tracing::{debug, info};

use crate::display::{Report, Verdict};

/// Decode hex given on the command line, ignoring spaces and colons
pub(crate) fn parse_hex(input: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let cleaned: String = input.chars().filter(|c| !matches!(c, ' ' | ':')).collect();
    Ok(hex::decode(cleaned)?)
}

/// Decode an ATR and show the parameters a reader would start with
pub(crate) fn atr_command(atr_hex: &str, clock: u32) -> Result<(), Box<dyn Error>> {
    let raw = parse_hex(atr_hex)?;
    let parsed = parse_atr(&raw)?;
    println!("{}", describe_atr(&parsed));

    let (protocol, fi, di) = Capabilities::selection(&parsed)?;
    let mut caps = Capabilities::initial(&SessionConfig::new().with_clock_frequency(clock));
    caps.apply(protocol, fi, di, &parsed)?;
    println!("\n{}", describe_capabilities(&caps));

    if parsed.ta1_present && (parsed.fi_index, parsed.di_index) != (fi, di) {
        let hint = format!(
            "TA1 offers Fi={} Di={}; negotiate with PPS to use it",
            parsed.fi_index, parsed.di_index
        );
        println!("{}", Verdict::Flag(hint));
    }
    Ok(())
}

/// Build a PPS request and optionally check a card's answer against it
pub(crate) fn pps_command(
    protocol: u8,
    fi: Option<u8>,
    di: Option<u8>,
    spu: Option<u8>,
    response: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let mut params = PpsParams::new(protocol);
    if fi.is_some() || di.is_some() {
        params = params.with_fd(fi.unwrap_or(1), di.unwrap_or(1));
    }
    if let Some(spu) = spu {
        params = params.with_spu(spu);
    }
    let request = build_pps_request(params);
    let len = check_request(&request)?;
    println!("{}", Report::new("PPS request").bytes("Bytes", &request[..len]));

    if let Some(response) = response {
        let response = parse_hex(response)?;
        match parse_pps_response(&request[..len], &response) {
            Ok(info) => {
                println!("{}", Verdict::Pass("PPS confirmed".into()));
                let negotiated = Report::new("Negotiated")
                    .row("Protocol", format_args!("T={}", info.protocol))
                    .row("Fi index", info.f_int)
                    .row("Di index", info.d_int)
                    .byte("SPU", info.spu);
                println!("{negotiated}");
            }
            Err(err) => println!("{}", Verdict::Flag(format!("PPS rejected: {err}"))),
        }
    }
    Ok(())
}

/// Print the ISO/IEC 7816-4 case of a command APDU
pub(crate) fn classify_command(apdu_hex: &str) -> Result<(), Box<dyn Error>> {
    let apdu = parse_hex(apdu_hex)?;
    let class = classify(&apdu)?;
    let report = Report::new("APDU")
        .row("Case", class.case)
        .row("Lc", class.lc)
        .row("Le", class.le)
        .row("Data offset", class.data_offset);
    println!("{report}");
    Ok(())
}

/// Print the timing budgets for a clock and set of indices
pub(crate) fn timing_command(clock: u32, fi: u8, di: u8, cwi: u8, bwi: u8, wi: u8) -> Result<(), Box<dyn Error>> {
    let atr = parse_atr(&timing_atr(fi, di, wi, cwi, bwi))?;
    let timeouts = compute_timeouts(clock, fi, di, &atr)?;
    println!("{}", describe_timeouts(&timeouts));
    Ok(())
}

/// Smallest ATR carrying the given indices: TA1, TC2 (WI) and TB3 for T=1
fn timing_atr(fi: u8, di: u8, wi: u8, cwi: u8, bwi: u8) -> Vec<u8> {
    let mut raw = vec![0x3B, 0x90, (fi << 4) | (di & 0x0F), 0xC0, wi, 0x21, (bwi << 4) | (cwi & 0x0F)];
    let tck = raw[1..].iter().fold(0, |acc, b| acc ^ b);
    raw.push(tck);
    raw
}

/// Reset a simulated card and exchange one APDU with it
pub(crate) fn simulate_command(
    protocol: Protocol,
    apdu_hex: &str,
    pps: bool,
    threaded: bool,
) -> Result<(), Box<dyn Error>> {
    let apdu = parse_hex(apdu_hex)?;
    classify(&apdu)?;

    let card = SimulatedCard::new(protocol);
    debug!(?card, "Simulated card");
    let config = SessionConfig::new().with_reset_timing(ResetTiming::IMMEDIATE);
    let mut session = Session::new(card.into_io(), StaticContacts::new(true), config);

    let (atr, response, caps) = if threaded {
        let handle = SessionWorker::spawn(session)?;
        let atr = handle.reset(ResetKind::Cold)?;
        if pps && atr.parsed.ta1_present {
            handle.negotiate_pps(offered_pps(&atr.parsed, protocol))?;
        }
        let response = handle.transfer(&apdu, 0)?;
        let caps = handle.get_capabilities()?;
        handle.close()?;
        (atr, response, caps)
    } else {
        let atr = session.reset(ResetKind::Cold)?;
        if pps && atr.parsed.ta1_present {
            session.negotiate_pps(offered_pps(&atr.parsed, protocol))?;
        }
        let response = session.transfer(&apdu, 0)?;
        let caps = session.capabilities().clone();
        session.close()?;
        (atr, response, caps)
    };
    info!(protocol = %caps.protocol, baud = caps.baud_rate(), "Simulation finished");

    println!("{}", Report::new("ATR").bytes("Bytes", &atr.raw));
    println!("\n{}", describe_capabilities(&caps));
    let exchange = Report::new("Exchange").bytes("Command", &apdu).bytes("Response", &response);
    println!("\n{exchange}");
    let verdict = match StatusWord::from_response(&response) {
        Some(sw) if sw.is_success() => Verdict::Pass(format!("Status {sw}")),
        Some(sw) => Verdict::Flag(format!("Status {sw}")),
        None => Verdict::Flag("Response without status word".into()),
    };
    println!("{verdict}");
    Ok(())
}

fn offered_pps(atr: &ParsedAtr, protocol: Protocol) -> [u8; 6] {
    build_pps_request(PpsParams::new(protocol.number()).with_fd(atr.fi_index, atr.di_index))
}

fn describe_atr(atr: &ParsedAtr) -> Report {
    let protocols: Vec<String> = atr.protocols.iter().map(|t| format!("T={t}")).collect();
    let mut report = Report::new("ATR")
        .row("Convention", atr.convention)
        .row("Protocols", protocols.join(", "))
        .row("Fi / Di index", format_args!("{} / {}", atr.fi_index, atr.di_index))
        .byte("Extra guard (TC1)", atr.extra_guard)
        .row("WI", atr.wi)
        .row("IFSC", atr.ifsc)
        .row("CWI / BWI", format_args!("{} / {}", atr.cwi, atr.bwi))
        .row("EDC", if atr.crc { "CRC" } else { "LRC" })
        .bytes("Historical bytes", &atr.history)
        .byte("TCK", atr.tck);
    if let Some(mode) = atr.specific_mode {
        let kind = if mode.implicit { "implicit" } else { "explicit" };
        report = report.row("Specific mode", format_args!("T={} ({kind})", mode.protocol));
    }
    if let Some(clock_stop) = atr.clock_stop {
        report = report.row("Clock stop", clock_stop);
    }
    if let Some(classes) = atr.class_support {
        report = report.row("Classes", format_args!("{classes:#04x}"));
    }
    report
}

fn describe_capabilities(caps: &Capabilities) -> String {
    let interface = Report::new("Interface")
        .row("Protocol", caps.protocol)
        .row(
            "Card clock",
            format_args!("{} Hz (divider {})", caps.working_frequency, caps.clock_divider),
        )
        .row("Max clock", format_args!("{} Hz", caps.max_clock_frequency))
        .row("Baud rate", caps.baud_rate())
        .row("Stop bits", caps.timeouts.guard.stop_bits)
        .row("IFSC", caps.ifsc);
    format!("{interface}\n{}", describe_timeouts(&caps.timeouts))
}

fn describe_timeouts(timeouts: &Timeouts) -> Report {
    Report::new("Timing")
        .row("ETU", format_args!("{} clocks", timeouts.etu))
        .row("Baud rate", timeouts.baud_rate)
        .row("CWT", format_args!("{} etu / {} ms", timeouts.cwt_etu, timeouts.cwt_ms))
        .row("BWT", format_args!("{} ms", timeouts.bwt_ms))
        .row("BGT", format_args!("{} ms", timeouts.bgt_ms))
        .row("WWT", format_args!("{} ms", timeouts.wwt_ms))
        .row("CGT", format_args!("{} etu", timeouts.guard.cgt_etu()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_accepts_separators() {
        assert_eq!(parse_hex("3B:65 00").unwrap(), vec![0x3B, 0x65, 0x00]);
        assert!(parse_hex("3G").is_err());
    }

    #[test]
    fn test_timing_atr_is_valid() {
        let atr = parse_atr(&timing_atr(9, 6, 10, 5, 4)).unwrap();
        assert_eq!((atr.fi_index, atr.di_index), (9, 6));
        assert_eq!((atr.wi, atr.cwi, atr.bwi), (10, 5, 4));
        assert!(atr.checksum_valid);
    }

    #[test]
    fn test_simulate_both_protocols() {
        simulate_command(Protocol::T0, "00A4040000", false, false).unwrap();
        simulate_command(Protocol::T1, "00A4040000", true, true).unwrap();
    }
}
