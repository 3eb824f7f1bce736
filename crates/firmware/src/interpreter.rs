use embedded_hal::digital::v2::OutputPin;
use log::{debug, error, info, warn};
use scara_protocol::{code, Control, Frame, MotorId, StepFrame, Wait};

use crate::{
    stepper::Stepper, Clock, Config, Error, Link, LinkError, SessionEnd, BUFFER_LEN, MAX_MOTORS,
};

type Result<T, P, L> = core::result::Result<T, Error<<P as OutputPin>::Error, <L as Link>::Error>>;

fn link_err<E>(e: LinkError<E>) -> Option<E> {
    match e {
        LinkError::Closed => None,
        LinkError::Io(e) => Some(e),
    }
}

// Inside a session, a closed link is a normal way to end, so it gets its own
// variant in this internal error type.
enum Stop<PE, LE> {
    Closed,
    Fatal(Error<PE, LE>),
}

impl<PE, LE> From<LinkError<LE>> for Stop<PE, LE> {
    fn from(e: LinkError<LE>) -> Self {
        match link_err(e) {
            None => Stop::Closed,
            Some(e) => Stop::Fatal(Error::Link(e)),
        }
    }
}

type Step<T, P, L> = core::result::Result<T, Stop<<P as OutputPin>::Error, <L as Link>::Error>>;

fn gpio<T, PE, LE>(r: core::result::Result<T, PE>) -> core::result::Result<T, Stop<PE, LE>> {
    r.map_err(|e| Stop::Fatal(Error::Gpio(e)))
}

/// Executes the byte stream from the host.
pub struct Interpreter<P, C> {
    config: Config,
    clock: C,
    steppers: heapless::Vec<Stepper<P>, MAX_MOTORS>,
    // Active low.
    enable: Option<P>,
    buf: heapless::Vec<u8, BUFFER_LEN>,
    authenticated: bool,
    wait_mark_us: u64,
    last_activity_us: u64,
    last_tx_us: u64,
}

impl<P, C> Interpreter<P, C>
where
    P: OutputPin,
    P::Error: core::fmt::Debug,
    C: Clock,
{
    pub fn new(config: Config, clock: C) -> Self {
        Interpreter {
            config,
            clock,
            steppers: heapless::Vec::new(),
            enable: None,
            buf: heapless::Vec::new(),
            authenticated: false,
            wait_mark_us: 0,
            last_activity_us: 0,
            last_tx_us: 0,
        }
    }

    /// Attaches the next motor. The first one gets id 1, and so on.
    ///
    /// If all the ids are taken, the pins are handed back.
    pub fn add_stepper(&mut self, step: P, dir: P) -> core::result::Result<MotorId, (P, P)> {
        let id = self.steppers.len() as u8 + 1;
        let Some(motor) = MotorId::new(id) else {
            return Err((step, dir));
        };
        self.steppers
            .push(Stepper::new(step, dir, self.config.step_wait_us))
            .map_err(Stepper::into_pins)?;
        Ok(motor)
    }

    /// Attaches the shared (active low) driver enable pin.
    pub fn set_enable_pin(&mut self, pin: P) {
        self.enable = Some(pin);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn stepper(&self, motor: MotorId) -> Option<&Stepper<P>> {
        self.steppers.get(motor.index())
    }

    /// Serves one session on `link`, returning when it is over.
    ///
    /// Whatever happens, the outputs are disabled and anything left in the
    /// receive buffer is thrown away before this returns.
    pub fn run_session<L: Link>(&mut self, link: &mut L) -> Result<SessionEnd, P, L> {
        let ret = match self.session(link) {
            Ok(end) => Ok(end),
            Err(Stop::Closed) => Ok(SessionEnd::Disconnected),
            Err(Stop::Fatal(e)) => {
                error!("session failed: {e:?}");
                Err(e)
            }
        };

        if !self.buf.is_empty() {
            debug!("discarding {} unprocessed bytes", self.buf.len());
        }
        self.buf.clear();
        let off = self.set_outputs(false).map_err(Error::Gpio);

        info!("session ended: {ret:?}");
        let end = ret?;
        off?;
        Ok(end)
    }

    fn session<L: Link>(&mut self, link: &mut L) -> Step<SessionEnd, P, L> {
        let now = self.clock.now_us();
        self.buf.clear();
        self.authenticated = self.config.auth_key.is_none();
        self.wait_mark_us = now;
        self.last_activity_us = now;
        for s in &mut self.steppers {
            s.set_wait_us(self.config.step_wait_us);
            s.reset_timer(now);
        }
        info!("session started");

        self.last_tx_us = now;
        let banner = self.config.banner;
        if !banner.is_empty() {
            self.send(link, banner)?;
        }

        loop {
            self.fill(link)?;

            let mut used = 0;
            while let Some((frame, len)) = Frame::parse(&self.buf[used..]) {
                used += len;
                if let Some(end) = self.dispatch(link, frame)? {
                    return Ok(end);
                }
            }
            if used > 0 {
                self.consume(used);
                self.last_activity_us = self.clock.now_us();
            }

            self.watchdog(link)?;
            let now = self.clock.now_us();
            if now.saturating_sub(self.last_activity_us) >= self.config.idle_timeout_us {
                warn!("nothing to do for {}us, giving up", now - self.last_activity_us);
                self.send(link, &[code::TIMEOUT])?;
                return Ok(SessionEnd::TimedOut);
            }
        }
    }

    // Reads as much as fits into the buffer.
    fn fill<L: Link>(&mut self, link: &mut L) -> Step<(), P, L> {
        let start = self.buf.len();
        if start == BUFFER_LEN {
            return Ok(());
        }
        // Can't fail: we're resizing up to the capacity.
        let _ = self.buf.resize(BUFFER_LEN, 0);
        let read = link.read(&mut self.buf[start..]);
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(start);
                return Err(e.into());
            }
        };
        self.buf.truncate(start + n);
        if n > 0 {
            self.last_activity_us = self.clock.now_us();
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        let len = self.buf.len();
        self.buf.copy_within(n..len, 0);
        self.buf.truncate(len - n);
    }

    fn send<L: Link>(&mut self, link: &mut L, bytes: &[u8]) -> Step<(), P, L> {
        link.write(bytes)?;
        self.last_tx_us = self.clock.now_us();
        Ok(())
    }

    fn watchdog<L: Link>(&mut self, link: &mut L) -> Step<(), P, L> {
        let now = self.clock.now_us();
        if now.saturating_sub(self.last_tx_us) >= self.config.keepalive_us {
            self.send(link, &[code::STILL_WORKING])?;
        }
        Ok(())
    }

    // Busy-waits, keeping the host informed that we're still here.
    fn wait_until<L: Link>(&mut self, link: &mut L, deadline_us: u64) -> Step<u64, P, L> {
        loop {
            let now = self.clock.now_us();
            if now >= deadline_us {
                return Ok(now);
            }
            self.watchdog(link)?;
        }
    }

    fn set_outputs(&mut self, on: bool) -> core::result::Result<(), P::Error> {
        if let Some(pin) = &mut self.enable {
            if on {
                pin.set_low()?;
            } else {
                pin.set_high()?;
            }
        }
        Ok(())
    }

    fn dispatch<L: Link>(&mut self, link: &mut L, frame: Frame) -> Step<Option<SessionEnd>, P, L> {
        let allowed = self.authenticated
            || matches!(
                frame,
                Frame::Control(
                    Control::Noop | Control::Ready | Control::EndOfData | Control::Auth(_)
                )
            );
        if !allowed {
            warn!("ignoring {frame:?} before authentication");
            return Ok(None);
        }

        match frame {
            Frame::Step(s) => self.step(link, s)?,
            Frame::Control(c) => match c {
                Control::Noop => {}
                Control::Ready => {
                    debug!("ready");
                    self.send(link, &[code::READY])?;
                }
                Control::EndOfData => {
                    self.send(link, &[code::END_OF_DATA])?;
                    return Ok(Some(SessionEnd::EndOfData));
                }
                Control::DisableOutputs => gpio(self.set_outputs(false))?,
                Control::EnableOutputs => gpio(self.set_outputs(true))?,
                Control::Auth(key) => match self.config.auth_key {
                    Some(expected) if expected == key => {
                        info!("authenticated");
                        self.authenticated = true;
                    }
                    Some(_) => {
                        warn!("wrong key");
                        return Ok(Some(SessionEnd::Rejected));
                    }
                    None => debug!("no key configured, ignoring auth"),
                },
                Control::SetStepWait { motor, wait_us } => {
                    match self.steppers.get_mut(motor.index()) {
                        Some(s) => {
                            debug!("motor {} waits {wait_us}us per step", motor.get());
                            s.set_wait_us(u32::from(wait_us));
                        }
                        None => warn!("no motor {}", motor.get()),
                    }
                }
                Control::WaitAtLeast(w) => self.wait_at_least(link, w)?,
                Control::WaitFor(w) => self.wait_for(link, w)?,
                Control::StillWorking | Control::Timeout => {
                    warn!("unexpected {c:?} from the host")
                }
                Control::Unknown(code) => warn!("unknown control code {code}"),
            },
        }
        Ok(None)
    }

    fn step<L: Link>(&mut self, link: &mut L, frame: StepFrame) -> Step<(), P, L> {
        let idx = frame.motor.index();
        let Some(stepper) = self.steppers.get_mut(idx) else {
            warn!("no motor {}", frame.motor.get());
            return Ok(());
        };
        gpio(stepper.set_direction(frame.direction))?;

        for _ in 0..frame.steps() {
            let due = self.steppers[idx].next_due_us();
            self.wait_until(link, due)?;
            gpio(self.steppers[idx].pulse(&self.clock))?;
        }
        Ok(())
    }

    // Waits until `w` has passed since the end of the previous wait-at-least.
    fn wait_at_least<L: Link>(&mut self, link: &mut L, w: Wait) -> Step<(), P, L> {
        let deadline = self.wait_mark_us + w.as_micros();
        self.wait_mark_us = self.wait_until(link, deadline)?;
        Ok(())
    }

    // Waits for `w` from now, and then lets every motor step straight away.
    fn wait_for<L: Link>(&mut self, link: &mut L, w: Wait) -> Step<(), P, L> {
        let deadline = self.clock.now_us() + w.as_micros();
        let now = self.wait_until(link, deadline)?;
        for s in &mut self.steppers {
            s.reset_timer(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        convert::Infallible,
        rc::Rc,
    };

    use scara_protocol::Direction;

    use super::*;

    const ENABLE: u8 = 99;

    // Shared between the pins and the clock, so pin events carry timestamps.
    #[derive(Clone, Default)]
    struct Bench {
        now: Rc<Cell<u64>>,
        events: Rc<RefCell<Vec<(u8, bool, u64)>>>,
    }

    impl Bench {
        fn events_of(&self, pin: u8) -> Vec<(bool, u64)> {
            self.events
                .borrow()
                .iter()
                .filter(|e| e.0 == pin)
                .map(|e| (e.1, e.2))
                .collect()
        }

        fn pulses(&self, motor: u8) -> Vec<u64> {
            self.events_of(motor * 10)
                .into_iter()
                .filter(|e| e.0)
                .map(|e| e.1)
                .collect()
        }
    }

    struct Pin {
        id: u8,
        bench: Bench,
    }

    impl Pin {
        fn record(&self, high: bool) {
            self.bench
                .events
                .borrow_mut()
                .push((self.id, high, self.bench.now.get()));
        }
    }

    impl OutputPin for Pin {
        type Error = Infallible;

        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            self.record(false);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.record(true);
            Ok(())
        }
    }

    // Every reading moves time along by a microsecond.
    struct TestClock(Bench);

    impl Clock for TestClock {
        fn now_us(&self) -> u64 {
            let t = self.0.now.get();
            self.0.now.set(t + 1);
            t
        }
    }

    struct TestLink {
        incoming: VecDeque<Vec<u8>>,
        hang_up: bool,
        sent: Vec<u8>,
    }

    impl TestLink {
        fn new(chunks: &[&[u8]], hang_up: bool) -> Self {
            TestLink {
                incoming: chunks.iter().map(|c| c.to_vec()).collect(),
                hang_up,
                sent: Vec::new(),
            }
        }
    }

    impl Link for TestLink {
        type Error = ();

        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, LinkError<()>> {
            match self.incoming.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.incoming.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.hang_up => Err(LinkError::Closed),
                None => Ok(0),
            }
        }

        fn write(&mut self, bytes: &[u8]) -> core::result::Result<(), LinkError<()>> {
            self.sent.extend_from_slice(bytes);
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            keepalive_us: 1_000,
            idle_timeout_us: 5_000,
            auth_key: None,
            banner: b"hi",
            step_wait_us: 100,
        }
    }

    fn setup(config: Config) -> (Interpreter<Pin, TestClock>, Bench) {
        let bench = Bench::default();
        let pin = |id| Pin {
            id,
            bench: bench.clone(),
        };
        let mut interp = Interpreter::new(config, TestClock(bench.clone()));
        for m in 1..=3 {
            interp.add_stepper(pin(m * 10), pin(m * 10 + 1)).ok().unwrap();
        }
        interp.set_enable_pin(pin(ENABLE));
        (interp, bench)
    }

    fn steps(motor: u8, delta: i32) -> u8 {
        StepFrame::new(
            MotorId::new(motor).unwrap(),
            Direction::of(delta),
            delta.unsigned_abs() as u8,
        )
        .unwrap()
        .to_byte()
    }

    fn disabled_at_end(bench: &Bench) -> bool {
        bench.events_of(ENABLE).last().map(|e| e.0) == Some(true)
    }

    #[test]
    fn handshake_and_steps() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(
            &[&[code::READY], &[steps(1, 4), steps(2, -2)], &[code::END_OF_DATA]],
            true,
        );
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::EndOfData);
        assert_eq!(link.sent, b"hi\x01\x02");

        assert_eq!(bench.pulses(1).len(), 4);
        assert_eq!(bench.pulses(2).len(), 2);
        assert!(bench.pulses(3).is_empty());
        // Direction pins: high is forward.
        assert!(bench.events_of(11).last().unwrap().0);
        assert!(!bench.events_of(21).last().unwrap().0);
        assert!(disabled_at_end(&bench));
    }

    #[test]
    fn steps_keep_to_the_schedule() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(&[&[steps(1, 16), steps(1, 16)]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Disconnected);

        let pulses = bench.pulses(1);
        assert_eq!(pulses.len(), 32);
        for w in pulses.windows(2) {
            assert!(w[1] - w[0] >= 98 && w[1] - w[0] <= 102, "{w:?}");
        }
        // Lateness doesn't add up. The first pulse can itself be a few
        // microseconds late, which only shortens the span.
        let total = pulses[31] - pulses[0];
        assert!((3090..=3102).contains(&total), "{total}");
    }

    #[test]
    fn partial_control_frames_wait_for_the_rest() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(&[&[code::SET_STEP_WAIT, 1], &[0x03, 0xE8]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Disconnected);
        // 0xE8 would be a motor frame if it were taken on its own.
        assert!(bench.pulses(7).is_empty());
        let m1 = interp.stepper(MotorId::new(1).unwrap()).unwrap();
        assert_eq!(m1.wait_us(), 1000);
    }

    #[test]
    fn truncated_frames_are_dropped_on_close() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(&[&[code::AUTH, 1, 2, 3]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Disconnected);
        assert!(disabled_at_end(&bench));

        // The next session starts from a clean buffer.
        let mut link = TestLink::new(&[&[code::READY]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Disconnected);
        assert_eq!(link.sent, b"hi\x01");
    }

    #[test]
    fn keepalive_then_timeout() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(&[], false);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::TimedOut);

        assert!(link.sent.starts_with(b"hi"));
        assert_eq!(*link.sent.last().unwrap(), code::TIMEOUT);
        let keepalives = link.sent.iter().filter(|&&b| b == code::STILL_WORKING).count();
        assert!((4..=5).contains(&keepalives), "{keepalives}");
        assert!(disabled_at_end(&bench));
    }

    #[test]
    fn auth_gates_motion() {
        let key = 0x0102_0304_0506_0708u64;
        let (mut interp, bench) = setup(Config {
            auth_key: Some(key),
            ..test_config()
        });
        let mut auth = vec![code::AUTH];
        auth.extend_from_slice(&key.to_be_bytes());
        let mut link = TestLink::new(
            &[
                &[code::READY, steps(1, 3)],
                auth.as_slice(),
                &[steps(1, 2), code::END_OF_DATA],
            ],
            true,
        );
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::EndOfData);
        assert_eq!(bench.pulses(1).len(), 2);
        assert_eq!(link.sent, b"hi\x01\x02");

        let mut wrong = vec![code::AUTH];
        wrong.extend_from_slice(&(key + 1).to_be_bytes());
        let mut link = TestLink::new(&[wrong.as_slice(), &[steps(1, 5)]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Rejected);
        assert_eq!(bench.pulses(1).len(), 2);
        assert!(disabled_at_end(&bench));
    }

    #[test]
    fn waits() {
        let (mut interp, _bench) = setup(test_config());
        let wait = Wait::from_micros(3_000).to_byte();
        let mut link = TestLink::new(&[&[code::WAIT_FOR, wait, code::END_OF_DATA]], true);
        let start = interp.clock().0.now.get();
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::EndOfData);
        assert!(interp.clock().0.now.get() - start >= 3_000);
        // The host hears from us while we wait.
        assert!(link.sent.iter().filter(|&&b| b == code::STILL_WORKING).count() >= 2);

        // Each wait-at-least counts from where the previous one ended.
        let wait = Wait::from_micros(2_000).to_byte();
        let mut link = TestLink::new(
            &[&[code::WAIT_AT_LEAST, wait, code::WAIT_AT_LEAST, wait, code::END_OF_DATA]],
            true,
        );
        let start = interp.clock().0.now.get();
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::EndOfData);
        let elapsed = interp.clock().0.now.get() - start;
        assert!((4_000..4_100).contains(&elapsed), "{elapsed}");
    }

    #[test]
    fn outputs_follow_the_host() {
        let (mut interp, bench) = setup(test_config());
        let mut link = TestLink::new(
            &[&[
                code::ENABLE_OUTPUTS,
                code::DISABLE_OUTPUTS,
                code::ENABLE_OUTPUTS,
            ]],
            true,
        );
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::Disconnected);
        let states: Vec<bool> = bench.events_of(ENABLE).into_iter().map(|e| e.0).collect();
        assert_eq!(states, vec![false, true, false, true]);
    }

    #[test]
    fn unknown_codes_are_skipped() {
        let (mut interp, _bench) = setup(test_config());
        let mut link = TestLink::new(&[&[5, 30, code::READY, code::END_OF_DATA]], true);
        assert_eq!(interp.run_session(&mut link).unwrap(), SessionEnd::EndOfData);
        assert_eq!(link.sent, b"hi\x01\x02");
    }

    #[test]
    fn at_most_seven_motors() {
        let (mut interp, bench) = setup(test_config());
        let pin = |id| Pin {
            id,
            bench: bench.clone(),
        };
        for m in 4..=7 {
            assert_eq!(interp.add_stepper(pin(m * 10), pin(m * 10 + 1)).ok(), MotorId::new(m));
        }
        assert!(interp.add_stepper(pin(80), pin(81)).is_err());
    }
}
