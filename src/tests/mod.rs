mod fakes;
mod semantic;
