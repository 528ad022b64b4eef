pub mod reports;
pub mod scans;
pub mod system;
pub mod volumes;
