//! The packet-driven query/event state machine (spec §4.D).
//!
//! One handler per packet variant updates `(IP accumulator, TNT cache,
//! event queues, TSC, CBR, flags)` and may enqueue events; three public
//! operations (`cond_branch`, `indirect_branch`, `event`) drive packet
//! consumption forward only as far as each needs. Grounded in the
//! overall shape of `iptr-decoder`'s packet dispatch (one match arm per
//! packet kind) generalized from its push-style callback into pulling
//! packets on demand, and in `original_source/libipt`'s event-binding
//! and errata model.

use pt_error::{ErrorKind, StatusFlags};
use pt_packet::{Cursor, Packet};

use crate::config::{Config, Errata};
use crate::event::{Binding, Event, EventKind};
use crate::exec_mode::ExecMode;
use crate::ip::{IpQuery, LastIp};
use crate::queue::EventQueues;
use crate::tnt_cache::TntCache;

/// Deferred event data waiting for the IP at which it becomes effective
/// (the next FUP or TIP-family packet).
#[derive(Default)]
struct Pending {
    mode: Option<ExecMode>,
    tsx: Option<(bool, bool)>,
    paging: Option<(u64, bool)>,
}

/// A packet-driven query/event decoder over one trace buffer.
pub struct QueryDecoder<'a> {
    cursor: Cursor<'a>,
    ip: LastIp,
    tnt: TntCache,
    queues: EventQueues,
    errata: Errata,
    tsc: u64,
    has_tsc: bool,
    cbr: Option<u8>,
    in_psb_plus: bool,
    tracing_enabled: bool,
    /// Set once a FUP has been seen outside PSB+ without an intervening
    /// TIP-family packet: supplies the source address for the next
    /// async-disabled / overflow event.
    fup_source: Option<u64>,
    overflow_pending: bool,
    /// Set on a TSX-abort MODE.TSX packet when BDM64 errata applies;
    /// consumed by the next [`Self::enqueue`] call, tainting whichever
    /// event that turns out to be.
    bdm64_pending: bool,
    released: [bool; Binding::COUNT],
    pending: Pending,
}

impl<'a> QueryDecoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], config: Config) -> Self {
        Self {
            cursor: Cursor::new(buf),
            ip: LastIp::new(),
            tnt: TntCache::new(),
            queues: EventQueues::new(),
            errata: config.errata,
            tsc: 0,
            has_tsc: false,
            cbr: None,
            in_psb_plus: false,
            tracing_enabled: false,
            fup_source: None,
            overflow_pending: false,
            bdm64_pending: false,
            released: [false; Binding::COUNT],
            pending: Pending::default(),
        }
    }

    #[must_use]
    pub fn get_offset(&self) -> usize {
        self.cursor.offset()
    }

    #[must_use]
    pub fn get_sync_offset(&self) -> Option<usize> {
        self.cursor.sync_offset()
    }

    /// # Errors
    /// [`ErrorKind::Eos`] if no PSB lies ahead of the cursor.
    pub fn sync_forward(&mut self) -> Result<usize, ErrorKind> {
        self.cursor.sync_forward()
    }

    /// # Errors
    /// [`ErrorKind::Eos`] if no PSB lies behind the cursor.
    pub fn sync_backward(&mut self) -> Result<usize, ErrorKind> {
        self.cursor.sync_backward()
    }

    /// # Errors
    /// [`ErrorKind::NoSync`] if `offset` is not a PSB.
    pub fn sync_set(&mut self, offset: usize) -> Result<(), ErrorKind> {
        self.cursor.sync_set(offset)
    }

    /// Pop one conditional-branch outcome, decoding forward if the TNT
    /// cache is currently empty.
    ///
    /// # Errors
    /// [`ErrorKind::BadQuery`] if a TIP (indirect-branch answer) is the
    /// next thing the stream provides.
    pub fn cond_branch(&mut self) -> Result<(bool, StatusFlags), ErrorKind> {
        loop {
            if !self.tnt.is_empty() {
                let taken = self.tnt.pop()?;
                return Ok((taken, self.status_flags()));
            }
            let (packet, _) = self.cursor.decode_next()?;
            let is_plain_tip = matches!(packet, Packet::Tip(_));
            self.handle_packet(packet)?;
            if is_plain_tip {
                return Err(ErrorKind::BadQuery);
            }
        }
    }

    /// Decode forward until a TIP is consumed, returning its IP.
    ///
    /// # Errors
    /// [`ErrorKind::BadQuery`] if a TNT (conditional-branch answer) is
    /// the next thing the stream provides.
    pub fn indirect_branch(&mut self) -> Result<(u64, StatusFlags), ErrorKind> {
        loop {
            let (packet, _) = self.cursor.decode_next()?;
            let is_plain_tip = matches!(packet, Packet::Tip(_));
            let is_tnt = matches!(packet, Packet::Tnt(_));
            self.handle_packet(packet)?;
            if is_plain_tip {
                return match self.ip.query()? {
                    IpQuery::Ip(ip) => Ok((ip, self.status_flags())),
                    IpQuery::Suppressed => {
                        Ok((0, self.status_flags() | StatusFlags::IP_SUPPRESSED))
                    }
                };
            }
            if is_tnt {
                return Err(ErrorKind::BadQuery);
            }
        }
    }

    /// Return the next releasable event, decoding forward as needed.
    ///
    /// # Errors
    /// [`ErrorKind::BadQuery`] if a conditional or indirect branch
    /// answer is required before any event becomes releasable.
    pub fn event(&mut self) -> Result<(Event, StatusFlags), ErrorKind> {
        loop {
            if let Some(ev) = self.take_releasable() {
                return Ok((ev, self.status_flags()));
            }
            let tnt_was_empty = self.tnt.is_empty();
            let (packet, _) = self.cursor.decode_next()?;
            let is_tnt = matches!(packet, Packet::Tnt(_));
            self.handle_packet(packet)?;
            if is_tnt && tnt_was_empty {
                return Err(ErrorKind::BadQuery);
            }
        }
    }

    fn take_releasable(&mut self) -> Option<Event> {
        for binding in [Binding::Now, Binding::Psbend, Binding::Tip, Binding::Fup] {
            let releasable = binding == Binding::Now || self.released[binding.index()];
            if releasable && self.queues.is_pending(binding) {
                return self.queues.dequeue(binding);
            }
        }
        None
    }

    fn status_flags(&self) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        for binding in [Binding::Now, Binding::Psbend, Binding::Tip, Binding::Fup] {
            if self.queues.is_pending(binding) {
                flags |= StatusFlags::EVENT_PENDING;
            }
        }
        if matches!(self.ip.query(), Ok(IpQuery::Suppressed)) {
            flags |= StatusFlags::IP_SUPPRESSED;
        }
        if self.cursor.remaining().is_empty() {
            flags |= StatusFlags::EOS;
        }
        flags
    }

    fn enqueue(&mut self, binding: Binding, kind: EventKind) -> Result<(), ErrorKind> {
        log::trace!("enqueue {kind:?} on {binding:?}");
        let has_tsc = self.has_tsc;
        let tsc = self.tsc;
        let status_update = self.in_psb_plus;
        let event = self.queues.enqueue(binding, kind)?;
        event.has_tsc = has_tsc;
        event.tsc = tsc;
        event.status_update = status_update;
        if self.bdm64_pending {
            event.bdm64_tainted = true;
            self.bdm64_pending = false;
        }
        if binding != Binding::Now {
            self.released[binding.index()] = false;
        }
        Ok(())
    }

    /// Resolve any pending MODE.Exec/MODE.TSX/PIP event now that `ip`
    /// is known to be effective here (called after every FUP/TIP-family
    /// packet).
    fn resolve_pending(&mut self, ip: u64) -> Result<(), ErrorKind> {
        if let Some(mode) = self.pending.mode.take() {
            self.enqueue(Binding::Now, EventKind::ExecMode { mode, ip })?;
        }
        if let Some((speculative, aborted)) = self.pending.tsx.take() {
            self.enqueue(
                Binding::Now,
                EventKind::Tsx {
                    ip,
                    speculative,
                    aborted,
                },
            )?;
        }
        if let Some((cr3, non_root)) = self.pending.paging.take() {
            self.enqueue(Binding::Now, EventKind::AsyncPaging { cr3, non_root, ip })?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_packet(&mut self, packet: Packet) -> Result<(), ErrorKind> {
        match packet {
            Packet::Pad => {}
            Packet::Psb => {
                self.in_psb_plus = true;
            }
            Packet::PsbEnd => {
                self.in_psb_plus = false;
                self.released[Binding::Psbend.index()] = true;
            }
            Packet::Fup(ip_packet) => {
                if self.in_psb_plus && self.errata.contains(Errata::BDM70) && self.ip.query().is_ok() {
                    log::warn!("BDM70: tolerating a repeated FUP inside PSB+");
                }
                self.ip.update(ip_packet.ipc, ip_packet.ip);
                self.released[Binding::Fup.index()] = true;
                if let Ok(IpQuery::Ip(ip)) = self.ip.query() {
                    if self.overflow_pending {
                        self.overflow_pending = false;
                        self.enqueue(Binding::Now, EventKind::Overflow { ip })?;
                    }
                    self.resolve_pending(ip)?;
                }
                if !self.in_psb_plus {
                    self.fup_source = match self.ip.query() {
                        Ok(IpQuery::Ip(ip)) => Some(ip),
                        _ => None,
                    };
                }
            }
            Packet::Tip(ip_packet) => {
                self.ip.update(ip_packet.ipc, ip_packet.ip);
                self.released[Binding::Tip.index()] = true;
                if let Ok(IpQuery::Ip(ip)) = self.ip.query() {
                    if self.overflow_pending {
                        self.overflow_pending = false;
                        self.enqueue(Binding::Now, EventKind::Overflow { ip })?;
                    }
                    self.resolve_pending(ip)?;
                    if !self.in_psb_plus {
                        if let Some(from) = self.fup_source.take() {
                            self.enqueue(Binding::Now, EventKind::AsyncBranch { from, to: ip })?;
                        }
                    }
                }
                self.fup_source = None;
            }
            Packet::TipPge(ip_packet) => {
                self.ip.update(ip_packet.ipc, ip_packet.ip);
                self.released[Binding::Tip.index()] = true;
                self.tracing_enabled = true;
                let ip = match self.ip.query()? {
                    IpQuery::Ip(ip) => ip,
                    IpQuery::Suppressed => return Err(ErrorKind::NoIp),
                };
                if self.overflow_pending {
                    self.overflow_pending = false;
                    self.enqueue(Binding::Now, EventKind::Overflow { ip })?;
                }
                self.resolve_pending(ip)?;
                self.enqueue(Binding::Now, EventKind::Enabled { ip })?;
                self.fup_source = None;
            }
            Packet::TipPgd(ip_packet) => {
                self.ip.update(ip_packet.ipc, ip_packet.ip);
                self.released[Binding::Tip.index()] = true;
                self.tracing_enabled = false;
                let ip = match self.ip.query() {
                    Ok(IpQuery::Ip(ip)) => ip,
                    _ => 0,
                };
                if self.overflow_pending {
                    self.overflow_pending = false;
                    self.enqueue(Binding::Now, EventKind::Overflow { ip })?;
                }
                self.resolve_pending(ip)?;
                if let Some(at) = self.fup_source.take() {
                    self.enqueue(Binding::Now, EventKind::AsyncDisabled { at, ip })?;
                } else {
                    self.enqueue(Binding::Now, EventKind::Disabled { ip })?;
                }
            }
            Packet::ModeExec(m) => {
                self.pending.mode = Some(ExecMode::from_csl_csd(m.csl, m.csd));
            }
            Packet::ModeTsx(m) => {
                self.pending.tsx = Some((m.intx, m.abrt));
                if m.abrt && self.errata.contains(Errata::BDM64) {
                    log::warn!("BDM64: next branch target may be unreliable after TSX abort");
                    self.bdm64_pending = true;
                }
            }
            Packet::Pip { cr3, non_root } => {
                if self.in_psb_plus {
                    self.enqueue(Binding::Now, EventKind::Paging { cr3, non_root })?;
                } else {
                    self.pending.paging = Some((cr3, non_root));
                }
            }
            Packet::Ovf => {
                self.tnt.clear();
                self.overflow_pending = true;
            }
            Packet::Tnt(t) => {
                self.tnt.stage(t.payload, t.bit_count)?;
            }
            Packet::Tsc(tsc) => {
                self.tsc = tsc;
                self.has_tsc = true;
            }
            Packet::Cbr(cbr) => {
                self.cbr = Some(cbr);
            }
            Packet::Unknown { .. } => {}
        }
        Ok(())
    }

    /// Current core:bus ratio, if a CBR packet has been seen.
    ///
    /// # Errors
    /// [`ErrorKind::NoCbr`] if none has.
    pub fn cbr(&self) -> Result<u8, ErrorKind> {
        self.cbr.ok_or(ErrorKind::NoCbr)
    }

    #[must_use]
    pub fn tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_packet::{Encoder, IpCompression, IpPacket, TntPacket};

    #[test]
    fn indirect_branch_then_cond_branch_scenario() {
        let buf: &'static mut [u8] = Box::leak(Box::new([0u8; 256]));
        let mut encoder = Encoder::new(buf);
        encoder.encode(&Packet::Psb).unwrap();
        encoder.encode(&Packet::PsbEnd).unwrap();
        encoder
            .encode(&Packet::Tnt(TntPacket {
                bit_count: 1,
                payload: 1,
            }))
            .unwrap();
        let written = encoder.offset();

        let mut decoder = QueryDecoder::new(&buf[..written], Config::default());
        decoder.sync_forward().unwrap();

        assert_eq!(
            decoder.indirect_branch().unwrap_err(),
            ErrorKind::BadQuery
        );
        let (taken, _) = decoder.cond_branch().unwrap();
        assert!(taken);
    }

    #[test]
    fn tip_pge_emits_enabled_event() {
        let buf: &'static mut [u8] = Box::leak(Box::new([0u8; 256]));
        let mut encoder = Encoder::new(buf);
        encoder.encode(&Packet::Psb).unwrap();
        encoder.encode(&Packet::PsbEnd).unwrap();
        encoder
            .encode(&Packet::TipPge(IpPacket {
                ipc: IpCompression::Upd32,
                ip: 0x1000,
            }))
            .unwrap();
        let written = encoder.offset();

        let mut decoder = QueryDecoder::new(&buf[..written], Config::default());
        decoder.sync_forward().unwrap();
        let (event, _) = decoder.event().unwrap();
        assert_eq!(event.kind, EventKind::Enabled { ip: 0x1000 });
    }

    #[test]
    fn overflow_binds_ip_from_following_fup() {
        let buf: &'static mut [u8] = Box::leak(Box::new([0u8; 256]));
        let mut encoder = Encoder::new(buf);
        encoder.encode(&Packet::Psb).unwrap();
        encoder.encode(&Packet::PsbEnd).unwrap();
        encoder.encode(&Packet::Ovf).unwrap();
        encoder
            .encode(&Packet::Fup(IpPacket {
                ipc: IpCompression::Upd32,
                ip: 0x1000,
            }))
            .unwrap();
        encoder
            .encode(&Packet::TipPgd(IpPacket {
                ipc: IpCompression::Suppressed,
                ip: 0,
            }))
            .unwrap();
        let written = encoder.offset();

        let mut decoder = QueryDecoder::new(&buf[..written], Config::default());
        decoder.sync_forward().unwrap();
        let (event, _) = decoder.event().unwrap();
        assert_eq!(event.kind, EventKind::Overflow { ip: 0x1000 });
    }
}
