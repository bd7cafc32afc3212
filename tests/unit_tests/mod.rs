mod cg;
mod comm;
mod gather;
mod operator;
