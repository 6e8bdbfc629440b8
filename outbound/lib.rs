// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Outbound delivery (§4.F, §4.G): the task queue that pushes finished
//! clips to cloud storage and notifies the booking API, plus the
//! connectivity monitor that gates it.

pub mod backoff;
pub mod clients;
pub mod connectivity;
pub mod queue;

pub use backoff::backoff_for;
pub use clients::{NotifyClient, ObjectStoreClient, ReqwestNotifyClient, ReqwestObjectStoreClient};
pub use connectivity::{ConnectivityMonitor, HttpProber, Prober};
pub use queue::{OutboundQueue, Stats, UploadTaskPayload};
