//! End-to-end demo: a blocking identity backend served asynchronously.
//!
//! The adapter's notify descriptor is registered on the application's own
//! event loop, so inference completion is observed the same way as any
//! other readiness event.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use inferloop::{
    interest, AsyncAdapter, Dispatch, EventKind, EventLoop, InferenceRuntime, Result, RuntimeConfig,
    Tensor, TensorInfo, TensorType,
};

/// Copies its inputs straight through to its outputs.
#[derive(Default)]
struct IdentityBackend {
    pending: Vec<Tensor>,
}

impl InferenceRuntime for IdentityBackend {
    fn configure(&mut self, config: RuntimeConfig) -> Result<()> {
        println!("configure: kind={} value={}", config.kind, config.value);
        Ok(())
    }

    fn load_model(&mut self, path: &str) -> Result<()> {
        println!("load_model: {path}");
        Ok(())
    }

    fn input_tensor_info(&self) -> Result<Vec<TensorInfo>> {
        Ok(vec![TensorInfo {
            data_type: TensorType::UInt8,
            size: 8,
            name: Some("input0".into()),
            dims: vec![8],
        }])
    }

    fn output_tensor_info(&self) -> Result<Vec<TensorInfo>> {
        self.input_tensor_info()
    }

    fn set_input_tensor_info(&mut self, _info: Vec<TensorInfo>) -> Result<()> {
        Ok(())
    }

    fn set_output_tensor_info(&mut self, _info: Vec<TensorInfo>) -> Result<()> {
        Ok(())
    }

    fn allocate_tensors(&mut self) -> Result<Vec<Tensor>> {
        Ok(vec![Tensor {
            data_type: TensorType::UInt8,
            data: vec![0; 8],
        }])
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn invoke(&mut self, inputs: &[Tensor]) -> Result<()> {
        self.pending = inputs.to_vec();
        Ok(())
    }

    fn get_output(&mut self) -> Result<Vec<Tensor>> {
        Ok(std::mem::take(&mut self.pending))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

fn main() -> Result<()> {
    let adapter = AsyncAdapter::new(Box::<IdentityBackend>::default())?;
    adapter.configure(RuntimeConfig {
        kind: 0,
        value: "cpu".into(),
    })?;
    adapter.load_model("models/identity.bin")?;
    adapter.prepare()?;

    let mut input = adapter.allocate_tensors()?;
    input[0].data.copy_from_slice(b"deadbeef");

    // The application loop watches the adapter's notify descriptor.
    let adapter = Arc::new(Mutex::new(adapter));
    let mut app_loop = EventLoop::new(false, false)?;
    let control = app_loop.control();
    let (done_tx, done_rx) = mpsc::channel();

    let watched = Arc::clone(&adapter);
    let notify_fd = {
        let guard = watched.lock().map_err(|_| {
            inferloop::Error::InvalidArgument("adapter lock poisoned")
        })?;
        inferloop::EventSource::descriptor(&*guard)
    };
    app_loop.add_handler(&notify_fd, interest().read(), move |_, _| {
        let mut adapter = match watched.lock() {
            Ok(guard) => guard,
            Err(_) => return Dispatch::Cancel,
        };
        match adapter.fetch_event_data() {
            Ok(event) if event.kind == EventKind::INFERENCE_SUCCESS => {
                let outputs = adapter.get_output().unwrap();
                done_tx.send(outputs).unwrap();
                control.stop().unwrap();
                Dispatch::Cancel
            }
            Ok(event) => {
                eprintln!("inference failed: {:?}", event.kind);
                control.stop().unwrap();
                Dispatch::Cancel
            }
            Err(inferloop::Error::WouldBlock) => Dispatch::Renew,
            Err(e) => {
                eprintln!("fetch failed: {e}");
                Dispatch::Cancel
            }
        }
    })?;

    adapter
        .lock()
        .map_err(|_| inferloop::Error::InvalidArgument("adapter lock poisoned"))?
        .invoke(input, Some(Box::new("request-1")))?;

    app_loop.run(inferloop::DEFAULT_WAIT_CAPACITY, -1, 5000)?;

    let outputs = done_rx
        .recv()
        .map_err(|_| inferloop::Error::InvalidArgument("no output produced"))?;
    println!(
        "output: {}",
        String::from_utf8_lossy(&outputs[0].data)
    );

    adapter
        .lock()
        .map_err(|_| inferloop::Error::InvalidArgument("adapter lock poisoned"))?
        .stop()?;
    Ok(())
}
