pub mod open_mode;
