#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Reg(pub u8);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FReg(pub u8);

pub use self::x64::*;

pub mod x64;
