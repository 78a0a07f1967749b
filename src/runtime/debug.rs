//! In-process debugger interface.
//!
//! A [`DebugSession`] receives [`DebugEvent`]s. The thread that raised an
//! event stays suspended, inside a safe region, and serves
//! [`DebugCommand`]s sent through the event until it is resumed or the
//! event is dropped.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use crossbeam::channel::{Receiver, Sender, unbounded};
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    descriptor::FieldType,
    error::VmError,
    runtime::{
        Reference, Slot, Value, instructions,
        interpreter::{CallStack, Frame},
        jit::Jit,
        thread::{ThreadEnv, ThreadState},
        verifier::VerificationType,
        vm::Global,
    },
};

bitflags! {
    /// Events a session is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        const BREAKPOINT = 0x01;
        const SINGLE_STEP = 0x02;
        const THREAD_START = 0x04;
        const THREAD_END = 0x08;
        const VM_INIT = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Breakpoint,
    SingleStep,
    ThreadStart,
    ThreadEnd,
    VmInit,
}

impl EventKind {
    fn mask(self) -> EventMask {
        match self {
            EventKind::Breakpoint => EventMask::BREAKPOINT,
            EventKind::SingleStep => EventMask::SINGLE_STEP,
            EventKind::ThreadStart => EventMask::THREAD_START,
            EventKind::ThreadEnd => EventMask::THREAD_END,
            EventKind::VmInit => EventMask::VM_INIT,
        }
    }
}

/// An instruction in a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub class: String,
    pub method: String,
    pub descriptor: String,
    pub pc: u32,
    pub line: Option<u16>,
}

/// Snapshot of one frame. `locals` and `stack` are raw slots; a wide value
/// takes two, its bits in the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub location: Location,
    pub locals: Vec<Slot>,
    pub stack: Vec<Slot>,
}

/// A thread known to the VM, as seen by [`DebugCommand::ReadThreads`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: u32,
    pub name: String,
    pub state: ThreadState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommand {
    /// Frames of the suspended thread, innermost first.
    ReadFrames,
    /// Every thread that has been started and not yet detached.
    ReadThreads,
    /// Stores into local `index` of the frame `depth` calls below the top.
    WriteLocal { depth: usize, index: usize, value: Value },
    WriteField { object: Reference, field: String, value: Value },
    /// Resumes and suspends again before the thread's next instruction.
    Step,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugReply {
    Frames(Vec<FrameInfo>),
    Threads(Vec<ThreadInfo>),
    Done,
    Error(String),
}

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("a debugger is already attached")]
    AlreadyAttached,
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("no method {0}")]
    NoSuchMethod(String),
    #[error("{method} has no instruction at pc {pc}")]
    InvalidLocation { method: String, pc: u32 },
}

/// A suspended thread. Dropping the event resumes it.
#[derive(Debug)]
pub struct DebugEvent {
    pub kind: EventKind,
    pub thread: u32,
    pub thread_name: String,
    /// `None` for thread and VM events raised outside any method.
    pub location: Option<Location>,
    pub frames: Vec<FrameInfo>,
    commands: Sender<DebugCommand>,
    replies: Receiver<DebugReply>,
}

impl DebugEvent {
    /// Sends `command` to the suspended thread and waits for its reply.
    /// `None` once the thread has been resumed.
    pub fn command(&self, command: DebugCommand) -> Option<DebugReply> {
        self.commands.send(command).ok()?;
        self.replies.recv().ok()
    }

    pub fn resume(self) {
        let _ = self.command(DebugCommand::Resume);
    }

    pub fn step(self) -> Option<DebugReply> {
        self.command(DebugCommand::Step)
    }
}

#[derive(Default)]
pub(crate) struct Debugger {
    attached: AtomicBool,
    session: Mutex<Option<(EventMask, Sender<DebugEvent>)>>,
}

impl Debugger {
    #[inline]
    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Relaxed)
    }

    fn attach(&self, mask: EventMask) -> Option<Receiver<DebugEvent>> {
        let mut session = self.session.lock();
        if session.is_some() {
            return None;
        }
        let (sender, receiver) = unbounded();
        *session = Some((mask, sender));
        self.attached.store(true, Ordering::Release);
        Some(receiver)
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        self.session.lock().take();
    }

    fn subscriber(&self) -> Option<(EventMask, Sender<DebugEvent>)> {
        self.session.lock().clone()
    }
}

/// An attached debugger. Detaches when dropped.
pub struct DebugSession {
    global: Arc<Global>,
    events: Receiver<DebugEvent>,
}

impl DebugSession {
    pub(crate) fn attach(global: Arc<Global>, mask: EventMask) -> Result<Self, DebugError> {
        let events = global.debugger.attach(mask).ok_or(DebugError::AlreadyAttached)?;
        debug!("debugger attached for {mask:?}");
        Ok(Self { global, events })
    }

    /// The next event, waiting at most `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<DebugEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    pub fn try_next_event(&self) -> Option<DebugEvent> {
        self.events.try_recv().ok()
    }

    /// Suspends every thread reaching `pc` of the method. Compiled code of
    /// the method is dropped so that the interpreter sees the instruction.
    pub fn set_breakpoint(
        &self,
        class: &str,
        method: &str,
        descriptor: &str,
        pc: u32,
    ) -> Result<(), DebugError> {
        let class = self.global.registry.resolve(class)?;
        let target = class
            .declared_method(method, descriptor)
            .ok_or_else(|| DebugError::NoSuchMethod(format!("{}.{method}{descriptor}", class.name)))?;
        let valid = target
            .code()
            .is_some_and(|code| is_instruction_start(&code.code, pc as usize));
        if !valid {
            return Err(DebugError::InvalidLocation {
                method: target.to_string(),
                pc,
            });
        }
        target.breakpoints.lock().insert(pc);
        target.has_breakpoints.store(true, Ordering::Release);
        Jit::invalidate(target);
        debug!("breakpoint set at {target} pc {pc}");
        Ok(())
    }

    pub fn clear_breakpoint(
        &self,
        class: &str,
        method: &str,
        descriptor: &str,
        pc: u32,
    ) -> Result<(), DebugError> {
        let class = self.global.registry.resolve(class)?;
        let target = class
            .declared_method(method, descriptor)
            .ok_or_else(|| DebugError::NoSuchMethod(format!("{}.{method}{descriptor}", class.name)))?;
        let mut breakpoints = target.breakpoints.lock();
        breakpoints.remove(&pc);
        target
            .has_breakpoints
            .store(!breakpoints.is_empty(), Ordering::Release);
        Ok(())
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.global.debugger.detach();
        for thread in self.global.threads.live_threads() {
            thread.single_step.store(false, Ordering::Relaxed);
        }
        debug!("debugger detached");
    }
}

fn is_instruction_start(code: &[u8], pc: usize) -> bool {
    let mut at = 0;
    while at < pc {
        match instructions::instruction_length(code, at) {
            Some(length) => at += length,
            None => return false,
        }
    }
    at == pc && pc < code.len()
}

fn location(frame: &Frame) -> Location {
    let method = &frame.method;
    let pc = frame.current_pc();
    Location {
        class: method.class_name.to_string(),
        method: method.name.to_string(),
        descriptor: method.raw_descriptor.to_string(),
        pc,
        line: method.code().and_then(|code| code.line_number(pc as usize)),
    }
}

fn frame_info(frame: &Frame) -> FrameInfo {
    FrameInfo {
        location: location(frame),
        locals: frame.slots[..frame.max_locals].to_vec(),
        stack: frame.slots[frame.max_locals..frame.max_locals + frame.sp].to_vec(),
    }
}

fn frames(stack: &CallStack, current: Option<&Frame>) -> Vec<FrameInfo> {
    current
        .into_iter()
        .chain(stack.frames.iter().rev())
        .map(frame_info)
        .collect()
}

fn frame_at<'f>(stack: &'f mut CallStack, current: Option<&'f mut Frame>, depth: usize) -> Option<&'f mut Frame> {
    match current {
        Some(frame) if depth == 0 => Some(frame),
        Some(_) => stack.frames.iter_mut().rev().nth(depth - 1),
        None => stack.frames.iter_mut().rev().nth(depth),
    }
}

/// Whether `value` may be stored in a slot the verifier typed `slot`.
/// References only go where the collector looks for them.
fn fits(slot: &VerificationType, value: &Value) -> bool {
    match (slot, value) {
        (VerificationType::Int, Value::Int(_))
        | (VerificationType::Float, Value::Float(_))
        | (VerificationType::Long, Value::Long(_))
        | (VerificationType::Double, Value::Double(_)) => true,
        (VerificationType::Top, value) => !matches!(value, Value::Reference(_)),
        (VerificationType::Null | VerificationType::Reference(_), Value::Reference(_)) => true,
        _ => false,
    }
}

fn write_local(
    env: &ThreadEnv,
    stack: &mut CallStack,
    current: Option<&mut Frame>,
    depth: usize,
    index: usize,
    value: Value,
) -> Result<(), String> {
    let frame = frame_at(stack, current, depth).ok_or_else(|| format!("no frame at depth {depth}"))?;
    let width = if value.is_wide() { 2 } else { 1 };
    if index + width > frame.max_locals {
        return Err(format!("local {index} out of range for {}", frame.method));
    }
    let pc = frame.current_pc() as usize;
    let state = frame
        .method
        .stack_maps
        .get()
        .and_then(|maps| maps.at(pc).cloned())
        .ok_or_else(|| format!("no type information at pc {pc}"))?;
    let slot_type = state.locals.get(index).unwrap_or(&VerificationType::Top);
    if !fits(slot_type, &value) {
        return Err(format!("local {index} holds {slot_type:?}, not {value:?}"));
    }
    if let Value::Reference(r) = value
        && r != 0
        && !env.heap().contains(r)
    {
        return Err(format!("{r} is not a live object"));
    }
    frame.slots[index] = value.to_slot();
    if width == 2 {
        frame.slots[index + 1] = 0;
    }
    Ok(())
}

fn write_field(env: &ThreadEnv, object: Reference, field: &str, value: Value) -> Result<(), String> {
    let target = env
        .heap()
        .get(object)
        .ok_or_else(|| format!("{object} is not a live object"))?;
    let info = target
        .class
        .instance_field(field)
        .ok_or_else(|| format!("{} has no field {field}", target.class.name))?;
    let compatible = match (&info.ty, value) {
        (
            FieldType::Boolean | FieldType::Byte | FieldType::Char | FieldType::Short | FieldType::Int,
            Value::Int(_),
        )
        | (FieldType::Long, Value::Long(_))
        | (FieldType::Float, Value::Float(_))
        | (FieldType::Double, Value::Double(_)) => true,
        (ty, Value::Reference(r)) => ty.is_reference() && (r == 0 || env.heap().contains(r)),
        _ => false,
    };
    if !compatible {
        return Err(format!("cannot store {value:?} into {field}: {}", info.ty));
    }
    target.put_field(info.slot, value.to_slot());
    Ok(())
}

fn threads(env: &ThreadEnv) -> Vec<ThreadInfo> {
    env.global
        .threads
        .live_threads()
        .into_iter()
        .map(|thread| ThreadInfo {
            id: thread.id,
            name: thread.name.clone(),
            state: thread.state(),
        })
        .collect()
}

/// Publishes an event and serves commands until resumed.
fn suspend(env: &ThreadEnv, stack: &mut CallStack, mut current: Option<&mut Frame>, kind: EventKind) {
    let Some((mask, events)) = env.global.debugger.subscriber() else {
        return;
    };
    if !mask.contains(kind.mask()) {
        return;
    }
    let (command_sender, commands) = unbounded();
    let (replies, reply_receiver) = unbounded();
    let event = DebugEvent {
        kind,
        thread: env.thread.id,
        thread_name: env.thread.name.clone(),
        location: current.as_deref().map(location),
        frames: frames(stack, current.as_deref()),
        commands: command_sender,
        replies: reply_receiver,
    };
    if events.send(event).is_err() {
        return;
    }
    debug!("thread {} suspended on {kind:?}", env.thread.id);

    let single_step = &env.thread.single_step;
    loop {
        let command = {
            let (stack, current) = (&*stack, current.as_deref());
            env.safe_region(ThreadState::Waiting, &|| stack.roots(current), || commands.recv())
        };
        let Ok(command) = command else {
            single_step.store(false, Ordering::Relaxed);
            break;
        };
        let reply = match command {
            DebugCommand::ReadFrames => DebugReply::Frames(frames(stack, current.as_deref())),
            DebugCommand::ReadThreads => DebugReply::Threads(threads(env)),
            DebugCommand::WriteLocal { depth, index, value } => {
                match write_local(env, stack, current.as_deref_mut(), depth, index, value) {
                    Ok(()) => DebugReply::Done,
                    Err(message) => DebugReply::Error(message),
                }
            }
            DebugCommand::WriteField { object, field, value } => {
                match write_field(env, object, &field, value) {
                    Ok(()) => DebugReply::Done,
                    Err(message) => DebugReply::Error(message),
                }
            }
            DebugCommand::Step if !mask.contains(EventMask::SINGLE_STEP) => {
                DebugReply::Error("single-step events are not enabled".to_string())
            }
            DebugCommand::Step => {
                single_step.store(true, Ordering::Relaxed);
                let _ = replies.send(DebugReply::Done);
                break;
            }
            DebugCommand::Resume => {
                single_step.store(false, Ordering::Relaxed);
                let _ = replies.send(DebugReply::Done);
                break;
            }
        };
        let _ = replies.send(reply);
    }
    debug!("thread {} resumed", env.thread.id);
}

/// Called by the interpreter before each instruction of a watched method.
pub(crate) fn on_instruction(env: &ThreadEnv, stack: &mut CallStack, frame: &mut Frame) {
    let kind = if env.thread.single_step.load(Ordering::Relaxed) {
        EventKind::SingleStep
    } else if frame.method.breakpoints.lock().contains(&(frame.pc as u32)) {
        EventKind::Breakpoint
    } else {
        return;
    };
    suspend(env, stack, Some(frame), kind);
}

/// Thread start and end, and VM initialization.
pub(crate) fn on_thread_event(env: &ThreadEnv, stack: &mut CallStack, kind: EventKind) {
    if env.global.debugger.is_attached() {
        suspend(env, stack, None, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_compatibility() {
        let reference = VerificationType::reference("java/lang/String");
        assert!(fits(&reference, &Value::Reference(0)));
        assert!(!fits(&reference, &Value::Int(1)));
        assert!(fits(&VerificationType::Int, &Value::Int(7)));
        assert!(!fits(&VerificationType::Int, &Value::Long(7)));
        assert!(fits(&VerificationType::Top, &Value::Double(1.0)));
        assert!(!fits(&VerificationType::Top, &Value::Reference(3)));
        assert!(!fits(&VerificationType::UninitializedThis, &Value::Reference(3)));
    }

    #[test]
    fn test_instruction_starts() {
        use crate::runtime::instructions as inst;
        // iconst_1; sipush 300; iadd; ireturn
        let code = [inst::ICONST_1, inst::SIPUSH, 0x01, 0x2c, inst::IADD, inst::IRETURN];
        assert!(is_instruction_start(&code, 0));
        assert!(is_instruction_start(&code, 1));
        assert!(!is_instruction_start(&code, 2));
        assert!(is_instruction_start(&code, 4));
        assert!(!is_instruction_start(&code, 6));
    }

    #[test]
    fn test_single_session() {
        let debugger = Debugger::default();
        assert!(!debugger.is_attached());
        let events = debugger.attach(EventMask::BREAKPOINT);
        assert!(events.is_some());
        assert!(debugger.is_attached());
        assert!(debugger.attach(EventMask::all()).is_none());
        debugger.detach();
        assert!(!debugger.is_attached());
        assert!(debugger.subscriber().is_none());
    }
}
