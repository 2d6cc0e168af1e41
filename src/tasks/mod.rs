mod expiry;

pub use expiry::ExpirySweepTask;
