// In-memory servo bus for tests and offline tooling
//
// Each simulated servo is a 256-byte register file that answers PING, READ,
// WRITE, REG_WRITE and ACTION like an STS servo. Replies go into a shared
// receive queue; reads on an empty queue sleep until the deadline, so
// timeouts cost real wall-clock time just as on hardware.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::trace;

use super::packet::{self, BROADCAST_ID, Instruction, Register};
use super::transport::Transport;

const REGISTER_COUNT: usize = 256;

/// STS3215 model number
const MODEL_NUMBER: u16 = 777;

/// One-shot disturbance applied to the next reply of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Garbage bytes on the line before the reply
    Noise(Vec<u8>),
    /// A well-formed reply from another id arrives first
    StrayReply { from: u8 },
    /// Last byte of the reply is flipped
    CorruptChecksum,
    /// Only the first n bytes of the reply make it onto the wire
    Truncate(usize),
    /// Reply carries one parameter byte fewer than requested
    ShortParams,
    /// Device does not answer at all
    Silent,
}

#[derive(Debug, Clone)]
struct SimServo {
    registers: [u8; REGISTER_COUNT],
    pending_writes: Vec<(u8, Vec<u8>)>,
    status_error: u8,
    faults: VecDeque<Fault>,
}

impl SimServo {
    fn new(id: u8) -> Self {
        let mut servo = Self {
            registers: [0u8; REGISTER_COUNT],
            pending_writes: Vec::new(),
            status_error: 0,
            faults: VecDeque::new(),
        };
        let model = packet::encode_word(MODEL_NUMBER);
        let max_position = packet::encode_word(4095);
        servo.store(Register::ModelNumber.into(), &model);
        servo.store(Register::Id.into(), &[id]);
        servo.store(Register::MaxPositionLimit.into(), &max_position);
        servo
    }

    fn store(&mut self, address: u8, data: &[u8]) {
        let start = address as usize;
        let end = (start + data.len()).min(REGISTER_COUNT);
        self.registers[start..end].copy_from_slice(&data[..end - start]);

        // Moves instantly to any commanded goal
        let goal = Register::GoalPosition as usize;
        if start <= goal + 1 && end > goal {
            let present = Register::PresentPosition as usize;
            self.registers[present] = self.registers[goal];
            self.registers[present + 1] = self.registers[goal + 1];
        }
    }

    fn load(&self, address: u8, len: u8) -> Vec<u8> {
        let start = address as usize;
        let end = (start + len as usize).min(REGISTER_COUNT);
        self.registers[start..end].to_vec()
    }

    fn apply_pending(&mut self) {
        for (address, data) in std::mem::take(&mut self.pending_writes) {
            self.store(address, &data);
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: BTreeMap<u8, SimServo>,
    rx: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

impl SimState {
    /// Execute one request; returns the reply parameters when the device answers
    fn execute(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Option<Vec<u8>> {
        let servo = self.devices.get_mut(&id)?;
        match instruction {
            Instruction::Ping => Some(Vec::new()),
            Instruction::Read => match params {
                [address, len] => Some(servo.load(*address, *len)),
                _ => None,
            },
            Instruction::Write => {
                let (&address, data) = params.split_first()?;
                servo.store(address, data);
                Some(Vec::new())
            }
            Instruction::RegWrite => {
                let (&address, data) = params.split_first()?;
                servo.pending_writes.push((address, data.to_vec()));
                Some(Vec::new())
            }
            Instruction::Action => {
                servo.apply_pending();
                Some(Vec::new())
            }
            Instruction::SyncRead | Instruction::SyncWrite => None,
        }
    }

    fn respond(&mut self, id: u8, reply_params: Vec<u8>) {
        let Some(servo) = self.devices.get_mut(&id) else {
            return;
        };
        let status_error = servo.status_error;
        let fault = servo.faults.pop_front();
        let new_id = servo.registers[Register::Id as usize];

        let mut params = reply_params;
        if fault == Some(Fault::ShortParams) {
            params.pop();
        }
        let Ok(mut reply) = packet::encode_raw(id, status_error, &params) else {
            return;
        };

        match fault {
            Some(Fault::Silent) => reply.clear(),
            Some(Fault::Noise(bytes)) => self.rx.extend(bytes),
            Some(Fault::StrayReply { from }) => {
                if let Ok(stray) = packet::encode_raw(from, 0, &params) {
                    self.rx.extend(stray);
                }
            }
            Some(Fault::CorruptChecksum) => {
                if let Some(last) = reply.last_mut() {
                    *last ^= 0xFF;
                }
            }
            Some(Fault::Truncate(n)) => reply.truncate(n),
            Some(Fault::ShortParams) | None => {}
        }
        self.rx.extend(reply);

        // Identity change takes effect after the reply from the old id
        if new_id != id {
            if let Some(servo) = self.devices.remove(&id) {
                self.devices.insert(new_id, servo);
            }
        }
    }
}

/// Shared handle to a simulated bus. Clones see the same devices.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// An empty bus: every request times out
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(ids: &[u8]) -> Self {
        let bus = Self::new();
        for &id in ids {
            bus.add_device(id);
        }
        bus
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, id: u8) {
        self.state().devices.insert(id, SimServo::new(id));
    }

    pub fn remove_device(&self, id: u8) {
        self.state().devices.remove(&id);
    }

    /// Ids currently on the bus, ascending
    pub fn device_ids(&self) -> Vec<u8> {
        self.state().devices.keys().copied().collect()
    }

    pub fn set_register(&self, id: u8, address: u8, value: u8) {
        if let Some(servo) = self.state().devices.get_mut(&id) {
            servo.store(address, &[value]);
        }
    }

    pub fn set_register_word(&self, id: u8, address: u8, value: u16) {
        if let Some(servo) = self.state().devices.get_mut(&id) {
            servo.store(address, &packet::encode_word(value));
        }
    }

    pub fn register(&self, id: u8, address: u8) -> Option<u8> {
        self.state()
            .devices
            .get(&id)
            .map(|servo| servo.registers[address as usize])
    }

    /// Status error byte the device reports in every reply
    pub fn set_status_error(&self, id: u8, error: u8) {
        if let Some(servo) = self.state().devices.get_mut(&id) {
            servo.status_error = error;
        }
    }

    /// Queue a fault for the next reply of `id`
    pub fn inject(&self, id: u8, fault: Fault) {
        if let Some(servo) = self.state().devices.get_mut(&id) {
            servo.faults.push_back(fault);
        }
    }

    pub fn pending_faults(&self, id: u8) -> usize {
        self.state()
            .devices
            .get(&id)
            .map_or(0, |servo| servo.faults.len())
    }

    /// Leave bytes in the receive buffer as if a late reply had arrived
    pub fn push_stale(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes.iter().copied());
    }

    /// Every frame written to the bus so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }
}

impl Transport for SimulatedBus {
    fn clear_input(&mut self) -> io::Result<()> {
        self.state().rx.clear();
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        state.sent.push(frame.to_vec());

        // Devices ignore anything that is not a valid request
        let Ok(request) = packet::decode(frame) else {
            trace!("Simulated bus ignoring invalid frame {:02X?}", frame);
            return Ok(());
        };
        let Ok(instruction) = Instruction::try_from(request.code) else {
            return Ok(());
        };

        if request.id == BROADCAST_ID {
            let ids: Vec<u8> = state.devices.keys().copied().collect();
            for id in ids {
                state.execute(id, instruction, &request.params);
            }
            return Ok(());
        }

        if let Some(params) = state.execute(request.id, instruction, &request.params) {
            state.respond(request.id, params);
        }
        Ok(())
    }

    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        {
            let mut state = self.state();
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo::packet::encode;
    use std::time::Duration;

    fn exchange(sim: &mut SimulatedBus, request: Vec<u8>) -> Vec<u8> {
        sim.write_frame(&request).unwrap();
        let mut buf = [0u8; 64];
        let n = sim
            .read_until(&mut buf, Instant::now() + Duration::from_millis(1))
            .unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_ping_reply_matches_wire_format() {
        let mut sim = SimulatedBus::with_devices(&[1]);
        let reply = exchange(&mut sim, encode(1, Instruction::Ping, &[]).unwrap());
        assert_eq!(reply, vec![0xFF, 0xFF, 0x01, 0x02, 0x00, 0xFC]);
    }

    #[test]
    fn test_read_model_number() {
        let mut sim = SimulatedBus::with_devices(&[1]);
        let reply = exchange(&mut sim, encode(1, Instruction::Read, &[3, 2]).unwrap());
        let frame = packet::decode(&reply).unwrap();
        assert_eq!(frame.params, packet::encode_word(MODEL_NUMBER).to_vec());
    }

    #[test]
    fn test_absent_device_is_silent() {
        let mut sim = SimulatedBus::with_devices(&[1]);
        assert!(exchange(&mut sim, encode(2, Instruction::Ping, &[]).unwrap()).is_empty());
    }

    #[test]
    fn test_invalid_request_is_ignored() {
        let mut sim = SimulatedBus::with_devices(&[1]);
        let mut request = encode(1, Instruction::Ping, &[]).unwrap();
        request[5] ^= 0x01;
        assert!(exchange(&mut sim, request).is_empty());
        assert_eq!(sim.sent_frames().len(), 1);
    }

    #[test]
    fn test_goal_write_moves_present_position() {
        let mut sim = SimulatedBus::with_devices(&[2]);
        let [lo, hi] = packet::encode_word(3000);
        let write = encode(2, Instruction::Write, &[42, lo, hi]).unwrap();
        exchange(&mut sim, write);
        assert_eq!(sim.register(2, 56), Some(lo));
        assert_eq!(sim.register(2, 57), Some(hi));
    }

    #[test]
    fn test_broadcast_action_is_silent_and_applies() {
        let mut sim = SimulatedBus::with_devices(&[1, 2]);
        for id in [1, 2] {
            let staged = encode(id, Instruction::RegWrite, &[40, 1]).unwrap();
            exchange(&mut sim, staged);
        }
        assert_eq!(sim.register(1, 40), Some(0));
        let action = encode(BROADCAST_ID, Instruction::Action, &[]).unwrap();
        assert!(exchange(&mut sim, action).is_empty());
        assert_eq!(sim.register(1, 40), Some(1));
        assert_eq!(sim.register(2, 40), Some(1));
    }

    #[test]
    fn test_silent_fault_swallows_reply() {
        let mut sim = SimulatedBus::with_devices(&[3]);
        sim.inject(3, Fault::Silent);
        assert!(exchange(&mut sim, encode(3, Instruction::Ping, &[]).unwrap()).is_empty());
        assert!(!exchange(&mut sim, encode(3, Instruction::Ping, &[]).unwrap()).is_empty());
    }
}
