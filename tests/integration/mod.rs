//! Integration Tests Module
//!
//! End-to-end tests of the QueryGIS query pipeline with scripted fakes for
//! the backend transport and the script runtime. No network access and no
//! Python interpreter are needed.

// Scripted transport, runtime and project fixtures
mod support;

// Submission, escalation, self-correction and transcript behavior
mod query_flow_test;

// Response parsing and code rewriting through the public API
mod code_handling_test;

// Config, settings store and first-run marker on disk
mod storage_test;
