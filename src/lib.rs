pub mod acquirer;
pub mod acquisition;
pub mod background;
pub mod cancel;
pub mod device;
pub mod error;
pub mod sink;
pub mod types;
pub mod waveform;

pub use acquirer::Acquirer;
pub use acquisition::{AcquisitionRequest, AcquisitionRun, Outcome, Recording, RunState};
pub use background::{AcquisitionHandle, Finished};
pub use cancel::CancelToken;
pub use device::{
    Backend, ConnectionConfig, Device, GattLink, InstrumentDevice, SyntheticDevice,
    TcpTransport, TcpTransportBuilder, Transport, WirelessDevice, WirelessStatus,
};
pub use error::{AcquisitionError, DeviceError};
pub use sink::{ChannelSink, Discard, Preview, SampleSink};
pub use types::{BufferEntry, Channel, ChannelSelection, Reading, Sample};
pub use waveform::TestCurve;
