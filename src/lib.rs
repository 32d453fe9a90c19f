#![warn(missing_docs)]
/*! A client for an electricity-metering device (the LM50TCP+) that
exposes 50 counter inputs over a register-oriented industrial protocol
carried on TCP.

# Architecture overview

The crate is layered bottom-up:

```text
  [ frame ]        encode requests, parse responses
      ↓
  [ values ]       interpret a payload as u16s, u32s or ASCII
      ↓
  [ transport ]    one TCP connection, one in-flight exchange, a deadline
      ↓
  [ device ]       typed registers, transaction correlation, caching
      ↓
  [ daemon ]       drift-corrected polling loop, reconnect, cancellation
```

`config`, `output` and `sink` are the external contracts this core is
built against: a plain configuration struct, the two one-shot printers,
and the time-series append sink. `signals` and `cancel` together provide
the daemon's shutdown story: the main thread blocks on an OS termination
signal, then flips a [`cancel::Cancel`] flag that every worker observes.

# Example

```no_run
use lm50_meter_client::device::Device;

let mut dev = Device::new("meter.example", "502");
dev.connect()?;
dev.read_steady()?;
dev.update_volatile()?;
println!("revision {}, serial {}", dev.revision()?, dev.serial_number()?);
# Ok::<(), lm50_meter_client::error::Error>(())
```
*/

pub mod cancel;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod frame;
pub mod output;
pub mod signals;
pub mod sink;
pub mod transport;
pub mod values;

pub use error::{Error, Result};
