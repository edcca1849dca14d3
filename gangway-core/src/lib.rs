// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_inception)]
#![allow(clippy::manual_async_fn)]

extern crate alloc;

pub type Result<T> = core::result::Result<T, Error>;

pub use bridge::{Bridge, BridgeHandle};
pub use config::{BridgeConfig, HandlerRegistrar};
pub use error::{Error, ResultCode};
pub use sam::{
    dispatch::{CommandKind, CommandRouter},
    parser::Command,
    response::Response,
    version::SamVersion,
    MAX_LINE_LENGTH,
};

mod bridge;
mod config;
mod sam;
mod shutdown;
mod util;

pub mod crypto;
pub mod error;
pub mod primitives;
pub mod router;
pub mod runtime;
