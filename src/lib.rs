//! An [OpenXR 1.0](https://registry.khronos.org/OpenXR/specs/1.0/html/xrspec.html)
//! runtime that drives a PC-tethered headset through a vendor compositor
//! SDK.
//!
//! The library builds as the runtime DLL an OpenXR loader discovers through
//! its single export, `xrNegotiateLoaderRuntimeInterface`. Inside, the work
//! splits into a few layers:
//!
//! - [`entry`] — loader negotiation and the C ABI dispatch table.
//! - [`instance`], [`system`] — the per-process instance, extension
//!   negotiation, path interning and headset queries.
//! - [`session`], [`frame`], [`state`] — the session lifecycle, the
//!   `xrWaitFrame`/`xrBeginFrame`/`xrEndFrame` pacing protocol and the
//!   8-state machine behind `xrPollEvent`.
//! - [`swapchain`], [`fixup`], [`compose`] — swapchain accounting, the
//!   per-slice commit planning and frame layer assembly.
//! - [`interop`] — the per-graphics-API bridges (D3D11, D3D12, Vulkan,
//!   OpenGL) and the internal D3D11 submission device that owns the
//!   handoff to the compositor.
//! - [`backend`] — the trait the vendor SDK binding implements, plus a
//!   deterministic mock used headless and by the test suites.
//!
//! # Headless use
//!
//! Without a vendor binding installed (see
//! [`entry::set_backend_factory`]) the runtime runs against
//! [`backend::mock::MockHmd`], which is also how the protocol-level test
//! suites drive it on machines with no headset or GPU:
//!
//! ```
//! # use std::sync::Arc;
//! # use parallax_openxr::{backend::mock::MockHmd, session::Session};
//! let session = Session::create_headless(Arc::new(MockHmd::default())).unwrap();
//!
//! session.begin(openxr_sys::ViewConfigurationType::PRIMARY_STEREO).unwrap();
//! ```

pub mod backend;
pub mod compose;
pub mod config;
pub mod entry;
pub mod error;
pub mod fixup;
pub mod format;
pub mod frame;
pub mod handles;
pub mod input;
pub mod instance;
pub mod interop;
pub mod logging;
pub mod session;
pub mod space;
pub mod state;
pub mod swapchain;
pub mod system;
pub mod time;
pub mod upscale;
