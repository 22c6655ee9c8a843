pub mod digiflazz;
pub mod h2h;
