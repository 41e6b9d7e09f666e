// Reconciliation
//
// Decides what the next descriptor should contain, given what already exists on the host:
// classify the installation, inspect volumes, resolve ports, reconcile credentials, render the
// descriptor and check it against existing data before anything is committed.

pub mod classifier;
pub mod credentials;
pub mod extractor;
pub mod generator;
pub mod ports;
pub mod validator;
pub mod volumes;
