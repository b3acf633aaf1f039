// tilepipe — software pipelining for tiled matmul loops
//
// Library root. Analysis and rewrite phases are listed in pipeline order;
// `pipeline` drives them and `verify` checks their postconditions.

pub mod config;
pub mod diag;
pub mod id;
pub mod ir;
pub mod print;
pub mod types;

pub mod axis;
pub mod layout;

pub mod pass;

pub mod classify;
pub mod multibuffer;
pub mod descriptor;
pub mod lower;
pub mod barrier;
pub mod schedule;
pub mod wait;
pub mod async_dot;

pub mod pipeline;
pub mod verify;

pub mod fixtures;
