mod fakes;
mod test_driver;
mod test_mailgun;
mod test_manager;
mod test_persist;
