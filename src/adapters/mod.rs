pub mod frame;
pub mod qlib_bin;
pub mod table;
pub mod tushare;
