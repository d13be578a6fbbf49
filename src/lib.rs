//! STK500 programmer protocol, bridged from HTTP to an AVR ISP bus.

pub mod bus;
pub mod constants;
pub mod device;
pub mod programmer;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use self::bus::{IspBus, ResetControl, ResetLine};
pub use self::device::{DeviceParameters, Part, PartDb};
pub use self::programmer::{Programmer, ProgrammerState};
pub use self::protocol::{Command, Reply};
pub use self::transport::{CommandTransport, HttpTransport};
