//! Non-blocking façade over a blocking [`InferenceRuntime`].
//!
//! The adapter owns a dedicated engine whose worker thread is the only
//! place backend methods run. Callers talk to the worker over a duplex
//! command channel: control commands are synchronous RPC (send, then block
//! for the echoed reply), `invoke` is fire-and-forget. Results come back
//! through two descriptors the caller can wire into its own event loop:
//! a notify outlet announcing inference completion, and an output queue
//! holding the produced tensors.
//!
//! An output record is always queued before its completion event is
//! published, so a consumer that saw the event never blocks in
//! [`AsyncAdapter::get_output`].

use std::os::fd::RawFd;

use crate::channel::{self, CommandChannel};
use crate::engine::{EventLoop, DEFAULT_WAIT_CAPACITY};
use crate::error::{Error, Result};
use crate::event::{EventData, EventKind, EventPayload};
use crate::handler::Dispatch;
use crate::interest::interest;
use crate::notify::{event_outlet, EventOutlet, EventPublisher, OutletHandlerId};
use crate::runtime::{InferenceRuntime, RuntimeConfig, Tensor, TensorInfo};
use crate::source::EventSource;

/// Commands understood by the adapter worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CommandId {
    Configure = 0,
    LoadModel = 1,
    InputTensorInfo = 2,
    OutputTensorInfo = 3,
    SetInputTensorInfo = 4,
    SetOutputTensorInfo = 5,
    AllocateTensors = 6,
    FreeTensors = 7,
    Prepare = 8,
    Invoke = 9,
    Stop = 10,
    GetOutput = 11,
}

impl TryFrom<i32> for CommandId {
    type Error = Error;

    fn try_from(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => CommandId::Configure,
            1 => CommandId::LoadModel,
            2 => CommandId::InputTensorInfo,
            3 => CommandId::OutputTensorInfo,
            4 => CommandId::SetInputTensorInfo,
            5 => CommandId::SetOutputTensorInfo,
            6 => CommandId::AllocateTensors,
            7 => CommandId::FreeTensors,
            8 => CommandId::Prepare,
            9 => CommandId::Invoke,
            10 => CommandId::Stop,
            11 => CommandId::GetOutput,
            _ => return Err(Error::ChannelProtocol("unknown command id")),
        })
    }
}

/// What the worker does with backend outputs after each invoke.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputPolicy {
    /// Collect outputs after every invoke, failed ones included, so the
    /// backend never carries a stale result into the next invoke. A record
    /// is queued for the caller only when the invoke itself succeeded.
    #[default]
    AlwaysCollect,
}

enum CommandArgs {
    None,
    Configure(RuntimeConfig),
    LoadModel(String),
    TensorInfo(Vec<TensorInfo>),
    Tensors(Vec<Tensor>),
    Invoke {
        inputs: Vec<Tensor>,
        context: Option<Box<dyn EventPayload>>,
    },
}

enum CommandReply {
    None,
    Status(Result<()>),
    TensorInfo(Result<Vec<TensorInfo>>),
    Tensors(Result<Vec<Tensor>>),
}

struct CommandData {
    args: CommandArgs,
    reply: CommandReply,
}

impl CommandData {
    fn request(args: CommandArgs) -> Box<Self> {
        Box::new(Self {
            args,
            reply: CommandReply::None,
        })
    }
}

struct OutputRecord {
    tensors: Vec<Tensor>,
}

/// Runs on the worker engine; sole owner of the backend module.
struct Worker {
    channel: CommandChannel<CommandData>,
    output: CommandChannel<OutputRecord>,
    publisher: EventPublisher,
    module: Box<dyn InferenceRuntime>,
    policy: OutputPolicy,
}

impl Worker {
    fn serve(&mut self, readiness: crate::event::Readiness) -> Dispatch {
        if readiness.is_error() {
            log::info!("command channel peer went away, worker retiring");
            return Dispatch::Cancel;
        }

        let (raw_id, mut data) = match self.channel.recv() {
            Ok(frame) => frame,
            Err(Error::ChannelClosed) => return Dispatch::Cancel,
            Err(e) => {
                log::error!("worker receive failed: {e}");
                return Dispatch::Cancel;
            }
        };
        let id = match CommandId::try_from(raw_id) {
            Ok(id) => id,
            Err(_) => {
                log::error!("dropping frame with unknown command id {raw_id}");
                return Dispatch::Renew;
            }
        };

        if id == CommandId::Invoke {
            self.invoke(std::mem::replace(&mut data.args, CommandArgs::None));
            return Dispatch::Renew;
        }

        data.reply = self.execute(id, std::mem::replace(&mut data.args, CommandArgs::None));
        if let Err(e) = self.channel.send(raw_id, data) {
            log::error!("worker reply failed: {e}");
            return Dispatch::Cancel;
        }
        Dispatch::Renew
    }

    fn execute(&mut self, id: CommandId, args: CommandArgs) -> CommandReply {
        match (id, args) {
            (CommandId::Configure, CommandArgs::Configure(config)) => {
                CommandReply::Status(self.module.configure(config))
            }
            (CommandId::LoadModel, CommandArgs::LoadModel(path)) => {
                CommandReply::Status(self.module.load_model(&path))
            }
            (CommandId::InputTensorInfo, _) => {
                CommandReply::TensorInfo(self.module.input_tensor_info())
            }
            (CommandId::OutputTensorInfo, _) => {
                CommandReply::TensorInfo(self.module.output_tensor_info())
            }
            (CommandId::SetInputTensorInfo, CommandArgs::TensorInfo(info)) => {
                CommandReply::Status(self.module.set_input_tensor_info(info))
            }
            (CommandId::SetOutputTensorInfo, CommandArgs::TensorInfo(info)) => {
                CommandReply::Status(self.module.set_output_tensor_info(info))
            }
            (CommandId::AllocateTensors, _) => CommandReply::Tensors(self.module.allocate_tensors()),
            (CommandId::FreeTensors, CommandArgs::Tensors(tensors)) => {
                CommandReply::Status(self.module.free_tensors(tensors))
            }
            (CommandId::Prepare, _) => CommandReply::Status(self.module.prepare()),
            (CommandId::Stop, _) => CommandReply::Status(self.module.stop()),
            _ => CommandReply::Status(Err(Error::ChannelProtocol(
                "arguments do not match command",
            ))),
        }
    }

    fn invoke(&mut self, args: CommandArgs) {
        let (inputs, context) = match args {
            CommandArgs::Invoke { inputs, context } => (inputs, context),
            _ => {
                log::error!("invoke frame without tensors, dropping");
                return;
            }
        };

        let invoked = self.module.invoke(&inputs);
        let outputs = match self.policy {
            OutputPolicy::AlwaysCollect => self.module.get_output(),
        };

        let kind = match (&invoked, &outputs) {
            (Ok(()), Ok(_)) => EventKind::INFERENCE_SUCCESS,
            (Err(e), _) => {
                log::warn!("inference failed: {e}");
                EventKind::INFERENCE_ERROR
            }
            (_, Err(e)) => {
                log::warn!("output collection failed: {e}");
                EventKind::INFERENCE_ERROR
            }
        };

        if kind == EventKind::INFERENCE_SUCCESS {
            // Queue the record first so a consumer woken by the event finds
            // it already present.
            if let Ok(tensors) = outputs {
                let record = Box::new(OutputRecord { tensors });
                if let Err(e) = self.output.send(CommandId::GetOutput as i32, record) {
                    log::error!("queueing output record failed: {e}");
                    self.announce(EventKind::INFERENCE_ERROR, context);
                    return;
                }
            }
            self.announce(EventKind::INFERENCE_SUCCESS, context);
        } else {
            self.announce(EventKind::INFERENCE_ERROR, context);
        }
    }

    fn announce(&self, kind: EventKind, context: Option<Box<dyn EventPayload>>) {
        let data = match context {
            Some(payload) => EventData::with_payload(kind, payload),
            None => EventData::new(kind),
        };
        if let Err(e) = self.publisher.publish(Box::new(data)) {
            log::error!("publishing inference event failed: {e}");
        }
    }
}

/// Asynchronous front of a blocking inference backend.
pub struct AsyncAdapter {
    // Dropped first: stops and joins the worker before the channels close.
    engine: EventLoop,
    command: CommandChannel<CommandData>,
    output: CommandChannel<OutputRecord>,
    outlet: EventOutlet,
}

impl AsyncAdapter {
    pub fn new(module: Box<dyn InferenceRuntime>) -> Result<Self> {
        Self::with_policy(module, OutputPolicy::default())
    }

    pub fn with_policy(module: Box<dyn InferenceRuntime>, policy: OutputPolicy) -> Result<Self> {
        let (command, worker_command) = channel::duplex::<CommandData>()?;
        let (output, worker_output) = channel::queue::<OutputRecord>()?;
        let (outlet, publisher) = event_outlet()?;

        let mut engine = EventLoop::new(true, false)?;
        let worker_fd = worker_command.descriptor();
        let mut worker = Worker {
            channel: worker_command,
            output: worker_output,
            publisher,
            module,
            policy,
        };
        engine.add_handler(
            &worker_fd,
            interest().read().error(),
            move |_, readiness| worker.serve(readiness),
        )?;
        engine.run(DEFAULT_WAIT_CAPACITY, -1, -1)?;

        Ok(Self {
            engine,
            command,
            output,
            outlet,
        })
    }

    fn call(&self, id: CommandId, args: CommandArgs) -> Result<CommandReply> {
        self.command.send(id as i32, CommandData::request(args))?;
        let (reply_id, data) = self.command.recv()?;
        if reply_id != id as i32 {
            return Err(Error::ChannelProtocol("reply id does not match request"));
        }
        Ok(data.reply)
    }

    fn call_status(&self, id: CommandId, args: CommandArgs) -> Result<()> {
        match self.call(id, args)? {
            CommandReply::Status(result) => result,
            _ => Err(Error::ChannelProtocol("unexpected reply shape")),
        }
    }

    fn call_tensor_info(&self, id: CommandId) -> Result<Vec<TensorInfo>> {
        match self.call(id, CommandArgs::None)? {
            CommandReply::TensorInfo(result) => result,
            _ => Err(Error::ChannelProtocol("unexpected reply shape")),
        }
    }

    pub fn configure(&self, config: RuntimeConfig) -> Result<()> {
        self.call_status(CommandId::Configure, CommandArgs::Configure(config))
    }

    pub fn load_model(&self, path: &str) -> Result<()> {
        self.call_status(CommandId::LoadModel, CommandArgs::LoadModel(path.into()))
    }

    pub fn input_tensor_info(&self) -> Result<Vec<TensorInfo>> {
        self.call_tensor_info(CommandId::InputTensorInfo)
    }

    pub fn output_tensor_info(&self) -> Result<Vec<TensorInfo>> {
        self.call_tensor_info(CommandId::OutputTensorInfo)
    }

    pub fn set_input_tensor_info(&self, info: Vec<TensorInfo>) -> Result<()> {
        self.call_status(CommandId::SetInputTensorInfo, CommandArgs::TensorInfo(info))
    }

    pub fn set_output_tensor_info(&self, info: Vec<TensorInfo>) -> Result<()> {
        self.call_status(CommandId::SetOutputTensorInfo, CommandArgs::TensorInfo(info))
    }

    pub fn allocate_tensors(&self) -> Result<Vec<Tensor>> {
        match self.call(CommandId::AllocateTensors, CommandArgs::None)? {
            CommandReply::Tensors(result) => result,
            _ => Err(Error::ChannelProtocol("unexpected reply shape")),
        }
    }

    pub fn free_tensors(&self, tensors: Vec<Tensor>) -> Result<()> {
        self.call_status(CommandId::FreeTensors, CommandArgs::Tensors(tensors))
    }

    pub fn prepare(&self) -> Result<()> {
        self.call_status(CommandId::Prepare, CommandArgs::None)
    }

    /// Queues one inference and returns immediately. Completion is
    /// announced through the notify outlet with `context` attached; the
    /// produced tensors wait in the output queue.
    pub fn invoke(
        &self,
        inputs: Vec<Tensor>,
        context: Option<Box<dyn EventPayload>>,
    ) -> Result<()> {
        self.command.send(
            CommandId::Invoke as i32,
            CommandData::request(CommandArgs::Invoke { inputs, context }),
        )
    }

    /// Takes the oldest queued output record, blocking until one arrives.
    ///
    /// Safe to call without blocking after an `INFERENCE_SUCCESS` event
    /// was fetched: its record is queued before the event is published.
    pub fn get_output(&self) -> Result<Vec<Tensor>> {
        let (id, record) = self.output.recv()?;
        if id != CommandId::GetOutput as i32 {
            return Err(Error::ChannelProtocol("malformed output record"));
        }
        Ok(record.tensors)
    }

    pub fn stop(&self) -> Result<()> {
        self.call_status(CommandId::Stop, CommandArgs::None)
    }

    /// Non-blocking fetch of the next completion event; see
    /// [`EventOutlet::fetch_event_data`].
    pub fn fetch_event_data(&mut self) -> Result<EventData> {
        self.outlet.fetch_event_data()
    }

    /// Subscribes a callback on the completion outlet.
    pub fn add_event_handler<F>(&mut self, kinds: EventKind, callback: F) -> OutletHandlerId
    where
        F: FnMut(&EventData) -> Dispatch + Send + 'static,
    {
        self.outlet.add_handler(kinds, callback)
    }

    pub fn remove_event_handler(&mut self, id: OutletHandlerId) -> Result<()> {
        self.outlet.remove_handler(id)
    }

    /// Stops the worker engine. Also performed on drop.
    pub fn shutdown(&mut self) -> Result<()> {
        self.engine.shutdown()
    }
}

/// The adapter registers with a consumer's engine through its notify
/// descriptor: readable exactly when a completion event is fetchable.
impl EventSource for AsyncAdapter {
    fn descriptor(&self) -> RawFd {
        self.outlet.descriptor()
    }
}
