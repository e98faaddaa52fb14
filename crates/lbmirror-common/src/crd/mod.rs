//! Custom Resource Definitions for lbmirror
//!
//! This module contains the CRDs owned by the mirroring pipeline.

mod mirrored_service;

pub use mirrored_service::{
    MirroredService, MirroredServicePort, MirroredServiceSpec, MirroredServiceStatus,
};
